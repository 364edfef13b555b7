//! Tunnel lifecycle for embedtun.
//!
//! A tunnel is brought up by the [`DeviceDriver`], which provisions an
//! interface, starts a device and opens the control listener. The
//! [`TunnelManager`] then starts an [`Acceptor`] for the listener and files
//! the result in its [`HandleTable`] under a fresh [`TunnelHandle`].

mod acceptor;
pub mod device;
mod driver;
mod error;
mod manager;
pub mod platform;
mod table;
pub mod types;

pub use acceptor::{Acceptor, AcceptorHandle, ConnectionSource};
pub use device::UserspaceDevice;
pub use driver::{DeviceDriver, RunningDevice};
pub use error::{TunnelError, TunnelResult};
pub use manager::TunnelManager;
pub use platform::{Platform, SystemPlatform, TunInterface, TunnelDevice, VirtualInterface};
pub use table::HandleTable;
pub use types::{AcceptorState, TunnelHandle, TunnelState, FAILURE_SENTINEL};
