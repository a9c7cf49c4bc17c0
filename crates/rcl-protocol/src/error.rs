use serde::{Deserialize, Serialize};

/// Remote-observable error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ErrorKind {
    /// A native driver call returned non-success.
    Driver,
    /// Device code failed to compile; the message carries the build log.
    BuildFailure,
    /// The caller used an object in a way its kind does not allow.
    ProtocolMisuse,
    /// The handle is unknown on this node or of the wrong type.
    InvalidHandle,
    /// Offsets, sizes or patterns are out of range.
    InvalidArgument,
    /// The platform does not provide the requested operation.
    Unsupported,
    /// A peer node failed while serving part of the request.
    Remote,
    /// The session has not completed authentication.
    NotAuthenticated,
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("timeout")]
    Timeout,

    #[error("server disconnected")]
    Disconnected,
}
