pub mod buffer;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod event;
pub mod executor;
pub mod host_buffer;
pub mod peer;
pub mod program;
pub mod server;
pub mod session;
pub mod sync;

pub use buffer::{Buffer, CopySource, PeerReader};
pub use device::{Device, TeardownReport};
pub use error::ClError;
pub use event::{Event, EventKind};
pub use executor::ClExecutor;
pub use program::{Kernel, Program};
pub use server::RclServer;
