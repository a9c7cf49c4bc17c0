pub mod connection;
pub mod tls;
pub mod auth;
pub mod error;

pub use connection::{RclConnection, ConnectionRole};
pub use error::TransportError;
