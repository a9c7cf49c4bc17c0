use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use rcl_core::config::{ServerConfig, TokenEntry};
use rcl_protocol::messages::{Message, PROTOCOL_VERSION};
use rcl_protocol::ProtocolError;
use rcl_transport::{auth, tls, ConnectionRole, RclConnection, TransportError};

use crate::discovery;
use crate::executor::ClExecutor;
use crate::peer::PeerDirectory;
use crate::session::Session;

const CHALLENGE_LEN: usize = 32;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-wide metrics tracked via atomic counters.
pub struct ServerMetrics {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU32,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub cl_commands: AtomicU64,
    pub start_time: std::time::Instant,
    pub bind_address: parking_lot::RwLock<String>,
}

impl ServerMetrics {
    fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU32::new(0),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            cl_commands: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
            bind_address: parking_lot::RwLock::new(String::new()),
        }
    }
}

/// The RCL server. Accepts client and peer connections and serves compute commands.
pub struct RclServer {
    config: ServerConfig,
    executor: Arc<ClExecutor>,
    next_session_id: AtomicU32,
    /// Accepted authentication tokens (empty = no auth required)
    accepted_tokens: Vec<TokenEntry>,
    metrics: Arc<ServerMetrics>,
}

impl RclServer {
    /// Load the configured driver and discover devices.
    ///
    /// Must be called inside a tokio runtime when peers are configured.
    pub fn new(
        config: ServerConfig,
        accepted_tokens: Vec<TokenEntry>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let driver = discovery::load_driver(config.driver, config.host_devices)?;
        let exposed = discovery::discover_devices(driver.as_ref(), config.expose_devices.as_deref());

        let mut executor = ClExecutor::new(driver, exposed, config.server_id, config.enable_profiling);
        if !config.peers.is_empty() {
            let runtime = tokio::runtime::Handle::try_current()?;
            info!("{} peer endpoint(s) configured", config.peers.len());
            executor = executor.with_peers(Arc::new(PeerDirectory::new(config.peers.clone(), runtime)));
        }

        Ok(Self::with_executor(config, accepted_tokens, Arc::new(executor)))
    }

    pub fn with_executor(
        config: ServerConfig,
        accepted_tokens: Vec<TokenEntry>,
        executor: Arc<ClExecutor>,
    ) -> Self {
        Self {
            config,
            executor,
            next_session_id: AtomicU32::new(1),
            accepted_tokens,
            metrics: Arc::new(ServerMetrics::new()),
        }
    }

    pub fn executor(&self) -> &Arc<ClExecutor> {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Bind the configured address and serve until Ctrl+C.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let devices = self.executor.device_infos();
        info!(
            "serving {} device(s): {}",
            devices.len(),
            devices
                .iter()
                .map(|d| d.device_name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        // Spawn periodic metrics logger
        let metrics = self.metrics.clone();
        let mut metrics_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        info!(
                            connections_total = metrics.connections_total.load(Ordering::Relaxed),
                            connections_active = metrics.connections_active.load(Ordering::Relaxed),
                            requests = metrics.requests_total.load(Ordering::Relaxed),
                            errors = metrics.errors_total.load(Ordering::Relaxed),
                            cl = metrics.cl_commands.load(Ordering::Relaxed),
                            "metrics snapshot"
                        );
                    }
                    _ = metrics_shutdown.changed() => { break; }
                }
            }
        });

        let bind_addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await?;
        self.serve(listener, shutdown_rx).await
    }

    /// Accept connections on `listener` until `shutdown` flips to true,
    /// then drain sessions and tear down every device.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let local_addr = listener.local_addr()?;
        *self.metrics.bind_address.write() = local_addr.to_string();

        // Build TLS acceptor if cert/key are provided
        let tls_acceptor = if let (Some(cert), Some(key)) =
            (&self.config.cert_path, &self.config.key_path)
        {
            info!("RCL server listening on {} (TLS)", local_addr);
            Some(tls::build_server_tls(cert, key)?)
        } else {
            info!("RCL server listening on {} (TCP)", local_addr);
            warn!("no TLS certificate configured - connections will be unencrypted");
            None
        };

        let max_clients = self.config.max_clients;
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (tcp_stream, peer_addr) = result?;
                    info!("new connection from {}", peer_addr);

                    // Enforce connection limit
                    let current = self.metrics.connections_active.load(Ordering::Relaxed);
                    if current >= max_clients {
                        warn!("connection from {} rejected: max_clients ({}) reached", peer_addr, max_clients);
                        drop(tcp_stream);
                        continue;
                    }

                    let ctx = ConnectionContext {
                        session_id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
                        server_id: self.config.server_id,
                        idle_timeout,
                        executor: self.executor.clone(),
                        accepted_tokens: self.accepted_tokens.clone(),
                        metrics: self.metrics.clone(),
                    };

                    self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
                    self.metrics.connections_active.fetch_add(1, Ordering::Relaxed);

                    let acceptor = tls_acceptor.clone();
                    tokio::spawn(async move {
                        let metrics = ctx.metrics.clone();
                        match establish(tcp_stream, acceptor).await {
                            Ok(conn) => ctx.handle_client(conn).await,
                            Err(e) => error!("connection setup from {} failed: {}", peer_addr, e),
                        }
                        metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                _ = shutdown.changed() => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }

        // Wait for active sessions to drain (max 10s)
        let remaining = self.metrics.connections_active.load(Ordering::Relaxed);
        if remaining > 0 {
            info!("waiting for {} active session(s) to finish (max 10s)", remaining);
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while self.metrics.connections_active.load(Ordering::Relaxed) > 0
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let still_active = self.metrics.connections_active.load(Ordering::Relaxed);
            if still_active > 0 {
                warn!("{} session(s) still active after drain timeout", still_active);
            }
        }

        let executor = self.executor.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || executor.shutdown()).await {
            error!("executor shutdown panicked: {}", e);
        }

        info!("server shut down cleanly");
        Ok(())
    }
}

async fn establish(
    stream: TcpStream,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
) -> Result<RclConnection, TransportError> {
    match acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            RclConnection::from_server_stream(tls_stream).await
        }
        None => RclConnection::from_tcp_stream(ConnectionRole::Server, stream).await,
    }
}

/// Everything one connection task needs.
struct ConnectionContext {
    session_id: u32,
    server_id: u16,
    idle_timeout: Duration,
    executor: Arc<ClExecutor>,
    accepted_tokens: Vec<TokenEntry>,
    metrics: Arc<ServerMetrics>,
}

impl ConnectionContext {
    async fn handle_client(self, conn: RclConnection) {
        let session_id = self.session_id;
        let conn = Arc::new(conn);

        let session = match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(&conn)).await {
            Ok(Ok(session)) => Arc::new(session),
            Ok(Err(e)) => {
                warn!(session_id, "handshake failed: {}", e);
                return;
            }
            Err(_) => {
                warn!(session_id, "handshake timed out");
                return;
            }
        };
        info!(session_id, "client '{}' authenticated", session.client_name());

        let mut in_flight = JoinSet::new();

        loop {
            let msg = match tokio::time::timeout(self.idle_timeout, conn.recv()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    info!(session_id, "client disconnected: {}", e);
                    break;
                }
                Err(_) => {
                    // A client blocked on a long await is not idle.
                    while in_flight.try_join_next().is_some() {}
                    if !in_flight.is_empty() {
                        continue;
                    }
                    warn!(
                        session_id,
                        "client idle timeout ({}s), disconnecting",
                        self.idle_timeout.as_secs()
                    );
                    break;
                }
            };
            self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

            // Reap finished command tasks.
            while in_flight.try_join_next().is_some() {}

            let reply = match msg {
                Message::ClCommand {
                    request_id,
                    command,
                } => {
                    self.metrics.cl_commands.fetch_add(1, Ordering::Relaxed);
                    let executor = self.executor.clone();
                    let session = session.clone();
                    let conn = conn.clone();
                    let metrics = self.metrics.clone();
                    // Commands may block (await, get_data), so each runs on the
                    // blocking pool and answers independently.
                    in_flight.spawn(async move {
                        let name = command.name();
                        let response = match tokio::task::spawn_blocking(move || {
                            executor.execute(&session, command)
                        })
                        .await
                        {
                            Ok(response) => response,
                            Err(e) => {
                                error!(session_id, "{} panicked: {}", name, e);
                                metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                        };
                        if response.is_error() {
                            metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                        let reply = Message::ClResponse {
                            request_id,
                            response,
                        };
                        if let Err(e) = conn.send(reply).await {
                            debug!(session_id, "response to {} dropped: {}", name, e);
                        }
                    });
                    None
                }
                Message::QueryDevices => Some(Message::DeviceList(self.executor.device_infos())),
                Message::QueryMetrics => Some(self.metrics_message()),
                Message::Ping => Some(Message::Pong),
                other => {
                    warn!(session_id, "unexpected message: {:?}", other);
                    self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                    Some(Message::Error(ProtocolError::UnsupportedCommand(
                        "unexpected message after handshake".to_string(),
                    )))
                }
            };

            if let Some(reply) = reply {
                if let Err(e) = conn.send(reply).await {
                    error!(session_id, "send error: {}", e);
                    break;
                }
            }
        }

        // Release what the session left behind, and again once commands
        // still running have finished and possibly allocated more. Runs
        // detached so the connection slot is freed even while a release
        // waits on the device.
        let leaked = session.handle_count();
        if leaked > 0 {
            warn!(session_id, "{} handle(s) leaked at disconnect, cleaning up", leaked);
        }
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let (first_executor, first_session) = (executor.clone(), session.clone());
            let first = tokio::task::spawn_blocking(move || first_executor.cleanup_session(&first_session));
            if let Err(e) = first.await {
                error!(session_id, "session cleanup panicked: {}", e);
            }
            if in_flight.is_empty() {
                return;
            }
            while in_flight.join_next().await.is_some() {}
            if let Err(e) = tokio::task::spawn_blocking(move || executor.cleanup_session(&session)).await {
                error!(session_id, "session cleanup panicked: {}", e);
            }
        });
        info!(session_id, "client session ended");
    }

    /// Hello / challenge / Authenticate / AuthResult.
    async fn handshake(&self, conn: &RclConnection) -> Result<Session, TransportError> {
        match conn.recv().await? {
            Message::Hello {
                protocol_version,
                name,
                ..
            } => {
                debug!(session_id = self.session_id, "hello from '{}' (protocol v{})", name, protocol_version);
                if protocol_version != PROTOCOL_VERSION {
                    conn.send(Message::Error(ProtocolError::ConnectionFailed(format!(
                        "protocol version {} not supported (server speaks {})",
                        protocol_version, PROTOCOL_VERSION
                    ))))
                    .await?;
                    return Err(TransportError::UnexpectedMessage(format!(
                        "protocol version {}",
                        protocol_version
                    )));
                }
            }
            other => {
                return Err(TransportError::UnexpectedMessage(format!("{:?}", other)));
            }
        }

        let challenge = auth::generate_challenge(CHALLENGE_LEN);
        conn.send(Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            name: "RCL Server".to_string(),
            challenge: Some(challenge.clone()),
        })
        .await?;

        let (token, response) = match conn.recv().await? {
            Message::Authenticate {
                token,
                challenge_response,
            } => (token, challenge_response),
            other => return Err(TransportError::UnexpectedMessage(format!("{:?}", other))),
        };

        let (client_name, allowed_devices) = if self.accepted_tokens.is_empty() {
            ("anonymous".to_string(), None)
        } else {
            let entry = self.accepted_tokens.iter().find(|entry| {
                entry.token == token
                    && auth::verify_challenge_response(&entry.token, &challenge, &response)
            });
            match entry {
                Some(entry) => (entry.name.clone(), entry.allowed_devices.clone()),
                None => {
                    conn.send(Message::AuthResult {
                        success: false,
                        session_id: None,
                        server_id: None,
                        available_devices: Vec::new(),
                        error_message: Some("invalid token".to_string()),
                    })
                    .await?;
                    return Err(TransportError::AuthFailed("invalid token".to_string()));
                }
            }
        };

        let session = Session::new(self.session_id, self.server_id, client_name, allowed_devices);
        let available_devices = self
            .executor
            .device_infos()
            .into_iter()
            .filter(|d| session.may_open(d.server_device_index))
            .collect();

        conn.send(Message::AuthResult {
            success: true,
            session_id: Some(self.session_id),
            server_id: Some(self.server_id),
            available_devices,
            error_message: None,
        })
        .await?;

        Ok(session)
    }

    fn metrics_message(&self) -> Message {
        let m = &self.metrics;
        Message::MetricsData {
            connections_total: m.connections_total.load(Ordering::Relaxed),
            connections_active: m.connections_active.load(Ordering::Relaxed),
            requests_total: m.requests_total.load(Ordering::Relaxed),
            errors_total: m.errors_total.load(Ordering::Relaxed),
            cl_commands: m.cl_commands.load(Ordering::Relaxed),
            uptime_secs: m.start_time.elapsed().as_secs(),
            server_id: self.server_id,
            server_address: m.bind_address.read().clone(),
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C"),
        Err(e) => error!("failed to listen for Ctrl+C: {}", e),
    }
}
