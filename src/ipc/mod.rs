//! TCP+msgpack transport between the host and worker processes.

pub mod codec;
pub mod server;

pub use codec::{Frame, Hello, WireError};
pub use server::IpcServer;
