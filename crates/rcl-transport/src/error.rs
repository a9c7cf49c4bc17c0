#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("TLS setup error: {0}")]
    TlsSetup(String),

    #[error("wire format error: {0}")]
    Wire(#[from] rcl_protocol::wire::WireError),

    #[error("remote error: {0}")]
    Remote(#[from] rcl_protocol::ProtocolError),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("authentication failed: {0}")]
    AuthFailed(String),
}
