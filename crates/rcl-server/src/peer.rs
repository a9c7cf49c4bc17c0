//! Connections to other nodes, used by cross-node buffer copies.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use rcl_client::{Client, ClientError};
use rcl_core::config::ServerEndpoint;
use rcl_protocol::cl_commands::{ClCommand, ClResponse};
use rcl_protocol::NetworkHandle;

use crate::buffer::PeerReader;
use crate::error::ClError;

/// Lazily connected clients for the configured peer endpoints, keyed by
/// the server id each peer reports during authentication.
pub struct PeerDirectory {
    endpoints: Vec<ServerEndpoint>,
    runtime: tokio::runtime::Handle,
    clients: Mutex<HashMap<u16, Arc<Client>>>,
}

impl PeerDirectory {
    /// `runtime` drives the peer connections; the [`PeerReader`] methods
    /// must not be called from one of its worker threads.
    pub fn new(endpoints: Vec<ServerEndpoint>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            endpoints,
            runtime,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn client_for(&self, server_id: u16) -> Result<Arc<Client>, ClError> {
        if let Some(client) = self.clients.lock().get(&server_id) {
            return Ok(client.clone());
        }

        for endpoint in &self.endpoints {
            let known = self
                .clients
                .lock()
                .values()
                .any(|c| c.address() == endpoint.address);
            if known {
                continue;
            }

            match self.runtime.block_on(Client::connect(endpoint)) {
                Ok(client) => {
                    info!(
                        server_id = client.server_id(),
                        "connected to peer {}", endpoint.address
                    );
                    let found = client.server_id() == server_id;
                    self.clients.lock().insert(client.server_id(), client.clone());
                    if found {
                        return Ok(client);
                    }
                }
                Err(e) => warn!("peer {} unreachable: {}", endpoint.address, e),
            }
        }

        Err(ClError::Remote {
            code: 0,
            message: format!("no peer connection to node {}", server_id),
        })
    }

    fn forget(&self, server_id: u16) {
        if self.clients.lock().remove(&server_id).is_some() {
            debug!(server_id, "dropped peer connection");
        }
    }
}

fn remote_error(server_id: u16, response: ClResponse) -> ClError {
    match response {
        ClResponse::Error { code, message, .. } => ClError::Remote {
            code,
            message: format!("node {}: {}", server_id, message),
        },
        other => ClError::Remote {
            code: 0,
            message: format!("node {}: unexpected response {:?}", server_id, other),
        },
    }
}

fn transport_error(server_id: u16, error: ClientError) -> ClError {
    ClError::Remote {
        code: 0,
        message: format!("node {}: {}", server_id, error),
    }
}

impl PeerReader for PeerDirectory {
    fn read_buffer(
        &self,
        buffer: NetworkHandle,
        offset: u64,
        size: u64,
        deps: &[NetworkHandle],
    ) -> Result<Vec<u8>, ClError> {
        let node = buffer.server_id;
        let client = self.client_for(node)?;

        let result = self.runtime.block_on(async {
            let response = client
                .execute(ClCommand::BufferRead {
                    buffer,
                    offset,
                    size,
                    deps: deps.to_vec(),
                })
                .await?;
            let event = match response {
                ClResponse::Event(event) => event,
                other => return Ok(Err(remote_error(node, other))),
            };

            let data = client.execute(ClCommand::EventGetData { event }).await;
            match client.execute(ClCommand::Release { handle: event }).await {
                Ok(ClResponse::Success) => {}
                Ok(other) => debug!("release of {} on node {}: {:?}", event, node, other),
                Err(e) => debug!("release of {} on node {} failed: {}", event, node, e),
            }

            Ok::<_, ClientError>(match data? {
                ClResponse::Data(bytes) => Ok(bytes),
                other => Err(remote_error(node, other)),
            })
        });

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.forget(node);
                Err(transport_error(node, e))
            }
        }
    }

    fn buffer_size(&self, buffer: NetworkHandle) -> Result<u64, ClError> {
        let node = buffer.server_id;
        let client = self.client_for(node)?;

        match self.runtime.block_on(client.execute(ClCommand::BufferSize { buffer })) {
            Ok(ClResponse::Size(size)) => Ok(size),
            Ok(other) => Err(remote_error(node, other)),
            Err(e) => {
                self.forget(node);
                Err(transport_error(node, e))
            }
        }
    }
}
