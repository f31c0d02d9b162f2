//! livesync-transport: Transport adapters
//!
//! Implementations of [`livesync_core::TransportAdapter`] for a directory
//! on this machine and for a root reached through a remote shell.

pub mod exec;
pub mod local;

pub use exec::{ExecTransport, RemoteShell};
pub use local::LocalTransport;
