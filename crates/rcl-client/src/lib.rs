pub mod client;
pub mod error;
pub mod handles;

pub use client::Client;
pub use error::ClientError;
pub use handles::{RemoteBuffer, RemoteDevice, RemoteEvent, RemoteKernel, RemoteProgram};
