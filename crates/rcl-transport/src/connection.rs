use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tracing::{debug, error, trace};

use rcl_protocol::cl_commands::{ClCommand, ClResponse};
use rcl_protocol::messages::{Message, RequestId};
use rcl_protocol::wire::{self, HEADER_SIZE};

use crate::error::TransportError;

/// Whether this side of the connection is the server or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Server,
    Client,
}

type PendingMap = Arc<DashMap<u64, oneshot::Sender<Message>>>;

/// An established connection to a remote RCL peer.
/// Handles framing, sending, and receiving messages.
///
/// Responses to commands issued through [`RclConnection::send_command`] are
/// routed by request id and never show up in [`RclConnection::recv`].
pub struct RclConnection {
    role: ConnectionRole,
    /// Sender half for outgoing frames
    tx: mpsc::Sender<Vec<u8>>,
    /// Incoming messages that are not routed to a pending request
    rx: Mutex<mpsc::Receiver<Message>>,
    next_request_id: AtomicU64,
    /// Pending responses: request_id -> oneshot sender
    pending: PendingMap,
}

impl RclConnection {
    /// Create a connection over a plain TCP stream.
    pub async fn from_tcp_stream(
        role: ConnectionRole,
        stream: TcpStream,
    ) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Self::setup(role, read_half, write_half).await
    }

    /// Create a connection from a raw TLS stream (server-side).
    pub async fn from_server_stream(
        stream: ServerTlsStream<TcpStream>,
    ) -> Result<Self, TransportError> {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::setup(ConnectionRole::Server, read_half, write_half).await
    }

    /// Create a connection from a raw TLS stream (client-side).
    pub async fn from_client_stream(
        stream: ClientTlsStream<TcpStream>,
    ) -> Result<Self, TransportError> {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::setup(ConnectionRole::Client, read_half, write_half).await
    }

    async fn setup<R, W>(
        role: ConnectionRole,
        read_half: R,
        write_half: W,
    ) -> Result<Self, TransportError>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(DashMap::new());

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (in_tx, in_rx) = mpsc::channel::<Message>(256);

        // Writer task: sends framed bytes to the network
        let mut write_half = write_half;
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    error!("write error: {}", e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Reader task: reads frames from the network and dispatches
        let pending_clone = pending.clone();
        let mut read_half = read_half;
        tokio::spawn(async move {
            let mut header_buf = [0u8; HEADER_SIZE];
            loop {
                if let Err(e) = read_half.read_exact(&mut header_buf).await {
                    debug!("connection closed: {}", e);
                    break;
                }

                let (flags, _stream_id, payload_len) = match wire::decode_header(&header_buf) {
                    Ok(v) => v,
                    Err(e) => {
                        error!("invalid frame header: {}", e);
                        break;
                    }
                };

                let mut payload = vec![0u8; payload_len as usize];
                if let Err(e) = read_half.read_exact(&mut payload).await {
                    error!("payload read error: {}", e);
                    break;
                }

                let msg = match wire::decode_message(&payload, flags) {
                    Ok(m) => m,
                    Err(e) => {
                        error!("message decode error: {}", e);
                        continue;
                    }
                };

                if let Message::ClResponse { request_id, .. } = &msg {
                    if let Some((_, sender)) = pending_clone.remove(&request_id.0) {
                        let _ = sender.send(msg);
                        continue;
                    }
                    trace!(request_id = request_id.0, "response without a pending request");
                }

                if in_tx.send(msg).await.is_err() {
                    debug!("incoming channel closed");
                    break;
                }
            }
            // Wake every caller still waiting for a response.
            pending_clone.clear();
        });

        Ok(Self {
            role,
            tx: out_tx,
            rx: Mutex::new(in_rx),
            next_request_id: AtomicU64::new(1),
            pending,
        })
    }

    /// Send a message without waiting for a response.
    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        let frame = wire::encode_message(&msg, 0)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a command and wait for its response.
    pub async fn send_command(&self, command: ClCommand) -> Result<ClResponse, TransportError> {
        let request_id = RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed));

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.0, tx);

        let msg = Message::ClCommand {
            request_id,
            command,
        };
        if let Err(e) = self.send(msg).await {
            self.pending.remove(&request_id.0);
            return Err(e);
        }

        let response = rx.await.map_err(|_| TransportError::ConnectionClosed)?;

        match response {
            Message::ClResponse { response, .. } => Ok(response),
            Message::Error(e) => Err(TransportError::Remote(e)),
            other => Err(TransportError::UnexpectedMessage(format!("{:?}", other))),
        }
    }

    /// Receive the next incoming message (non-response messages).
    pub async fn recv(&self) -> Result<Message, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    /// Number of commands still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }
}
