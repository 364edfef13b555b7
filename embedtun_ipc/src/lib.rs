//! embedtun control IPC
//!
//! This crate defines the control protocol spoken on a live tunnel's local
//! socket and the transport used by both ends: the per-interface listener a
//! tunnel accepts control connections on, and the client used by tools.

pub mod messages;
pub mod transport;

/// Re-export common types for convenience
pub use messages::{ConfigLine, ControlRequest, ControlResponse};
pub use transport::{
    socket_path, ControlClient, ControlConnection, ControlListener, IpcError, IpcResult,
};
