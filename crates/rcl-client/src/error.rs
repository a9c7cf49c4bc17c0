use rcl_protocol::cl_commands::ClResponse;
use rcl_protocol::ErrorKind;
use rcl_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("{kind:?} error ({code}): {message}")]
    Remote {
        kind: ErrorKind,
        code: i32,
        message: String,
    },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    pub(crate) fn unexpected(response: ClResponse) -> Self {
        match response {
            ClResponse::Error {
                kind,
                code,
                message,
            } => ClientError::Remote {
                kind,
                code,
                message,
            },
            other => ClientError::UnexpectedResponse(format!("{:?}", other)),
        }
    }

    /// The remote error class, if this error was reported by the server.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
