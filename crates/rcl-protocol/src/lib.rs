pub mod handle;
pub mod messages;
pub mod cl_commands;
pub mod device_info;
pub mod wire;
pub mod error;

pub use handle::{NetworkHandle, ResourceType};
pub use messages::{Message, RequestId};
pub use error::{ErrorKind, ProtocolError};
