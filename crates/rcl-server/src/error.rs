use rcl_protocol::cl_commands::ClResponse;
use rcl_protocol::ErrorKind;

use crate::driver::{DriverError, CL_BUILD_PROGRAM_FAILURE};

/// Errors surfaced by device, buffer, event and program operations.
#[derive(Debug, thiserror::Error)]
pub enum ClError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("A build error occurred!\n/// OPENCL BUILD LOG\n{log}\n/// OPENCL BUILD LOG END")]
    BuildFailure { log: String },

    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    #[error("resource leak: {0}")]
    ResourceLeak(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("remote error ({code}): {message}")]
    Remote { code: i32, message: String },

    #[error("not authenticated")]
    NotAuthenticated,
}

impl ClError {
    pub fn build_failure(log: &str) -> Self {
        ClError::BuildFailure {
            log: log.trim_end().to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ClError::Driver(_) => ErrorKind::Driver,
            ClError::BuildFailure { .. } => ErrorKind::BuildFailure,
            ClError::ProtocolMisuse(_) => ErrorKind::ProtocolMisuse,
            // Leaks are only logged; reported as a driver-level failure if ever returned.
            ClError::ResourceLeak(_) => ErrorKind::Driver,
            ClError::InvalidHandle(_) => ErrorKind::InvalidHandle,
            ClError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ClError::Unsupported(_) => ErrorKind::Unsupported,
            ClError::Remote { .. } => ErrorKind::Remote,
            ClError::NotAuthenticated => ErrorKind::NotAuthenticated,
        }
    }

    /// Raw native status where one exists, 0 otherwise.
    pub fn code(&self) -> i32 {
        match self {
            ClError::Driver(e) => e.code,
            ClError::BuildFailure { .. } => CL_BUILD_PROGRAM_FAILURE,
            ClError::Remote { code, .. } => *code,
            _ => 0,
        }
    }

    pub fn to_response(&self) -> ClResponse {
        ClResponse::Error {
            kind: self.kind(),
            code: self.code(),
            message: self.to_string(),
        }
    }
}
