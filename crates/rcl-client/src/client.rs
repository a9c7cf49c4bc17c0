use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info};

use rcl_core::config::ServerEndpoint;
use rcl_protocol::cl_commands::{ClCommand, ClResponse};
use rcl_protocol::device_info::DeviceInfo;
use rcl_protocol::messages::{Message, PROTOCOL_VERSION};
use rcl_protocol::NetworkHandle;
use rcl_transport::{auth, tls, ConnectionRole, RclConnection};

use crate::error::ClientError;
use crate::handles::{RemoteDevice, RemoteHandle};

/// An authenticated connection to one RCL server.
///
/// Cheap to share: handles created through it keep an `Arc<Client>` so their
/// `Release` can still be sent after the caller dropped its own reference.
pub struct Client {
    conn: RclConnection,
    address: String,
    server_id: u16,
    session_id: u32,
    devices: Vec<DeviceInfo>,
    runtime: tokio::runtime::Handle,
}

impl Client {
    /// Connect to a server and perform the Hello/Authenticate handshake.
    pub async fn connect(endpoint: &ServerEndpoint) -> Result<Arc<Self>, ClientError> {
        info!("connecting to server: {}", endpoint.address);

        let stream = TcpStream::connect(&endpoint.address)
            .await
            .map_err(rcl_transport::TransportError::from)?;

        let conn = if endpoint.tls {
            let connector = tls::build_client_tls(endpoint.ca_cert.as_deref())?;
            let server_name = tls::server_name_for(&endpoint.address)?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(rcl_transport::TransportError::from)?;
            RclConnection::from_client_stream(tls_stream).await?
        } else {
            RclConnection::from_tcp_stream(ConnectionRole::Client, stream).await?
        };

        conn.send(Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            name: "RCL Client".to_string(),
            challenge: None,
        })
        .await?;

        let challenge = match conn.recv().await? {
            Message::Hello { challenge, .. } => challenge.unwrap_or_default(),
            Message::Error(e) => return Err(ClientError::AuthFailed(e.to_string())),
            _ => Vec::new(),
        };

        let challenge_response = auth::compute_challenge_response(&endpoint.token, &challenge);
        conn.send(Message::Authenticate {
            token: endpoint.token.clone(),
            challenge_response,
        })
        .await?;

        match conn.recv().await? {
            Message::AuthResult {
                success: true,
                session_id,
                server_id,
                available_devices,
                ..
            } => {
                let server_id = server_id.unwrap_or(0);
                info!(
                    "authenticated with server (id={}), {} device(s): {}",
                    server_id,
                    available_devices.len(),
                    available_devices
                        .iter()
                        .map(|d| d.device_name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                Ok(Arc::new(Self {
                    conn,
                    address: endpoint.address.clone(),
                    server_id,
                    session_id: session_id.unwrap_or(0),
                    devices: available_devices,
                    runtime: tokio::runtime::Handle::current(),
                }))
            }
            Message::AuthResult {
                success: false,
                error_message,
                ..
            } => Err(ClientError::AuthFailed(error_message.unwrap_or_default())),
            other => Err(ClientError::AuthFailed(format!(
                "unexpected response during auth: {:?}",
                other
            ))),
        }
    }

    /// Send one command and wait for its response.
    ///
    /// `ClResponse::Error` is returned as a value; use the typed handles for
    /// error conversion.
    pub async fn execute(&self, command: ClCommand) -> Result<ClResponse, ClientError> {
        debug!(server_id = self.server_id, "sending {}", command.name());
        Ok(self.conn.send_command(command).await?)
    }

    /// Devices advertised by the server during the handshake.
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Refresh the device list.
    pub async fn query_devices(&self) -> Result<Vec<DeviceInfo>, ClientError> {
        self.conn.send(Message::QueryDevices).await?;
        match self.conn.recv().await? {
            Message::DeviceList(devices) => Ok(devices),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.conn.send(Message::Ping).await?;
        match self.conn.recv().await? {
            Message::Pong => Ok(()),
            other => Err(ClientError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Open the server device with index `index`.
    pub async fn open_device(self: &Arc<Self>, index: u32) -> Result<RemoteDevice, ClientError> {
        match self.execute(ClCommand::OpenDevice { index }).await? {
            ClResponse::Device(handle) => Ok(RemoteDevice::new(self.adopt(handle))),
            other => Err(ClientError::unexpected(other)),
        }
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn adopt(self: &Arc<Self>, handle: NetworkHandle) -> Arc<RemoteHandle> {
        Arc::new(RemoteHandle {
            client: self.clone(),
            handle,
        })
    }

    /// Fire-and-forget `Release` used from `Drop`.
    pub(crate) fn release_detached(self: &Arc<Self>, handle: NetworkHandle) {
        let client = self.clone();
        self.runtime.spawn(async move {
            if let Err(e) = client.execute(ClCommand::Release { handle }).await {
                debug!("release of {} failed: {}", handle, e);
            }
        });
    }
}
