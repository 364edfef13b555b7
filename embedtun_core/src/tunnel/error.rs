//! Error types for the tunnel module.

use thiserror::Error;

use crate::settings::SettingsError;
use embedtun_ipc::IpcError;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error types that can occur in tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The virtual interface could not be created or named
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// The device rejected bring-up or configuration
    #[error("Engine error: {0}")]
    Engine(String),

    /// The tunnel document is malformed
    #[error("Configuration parse error: {0}")]
    Settings(#[from] SettingsError),

    /// The control listener could not be bound
    #[error("Listener error: {0}")]
    Listener(String),

    /// Text arriving at the host boundary could not be decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The manager's runtime could not be built
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Control connection error
    #[error("Control connection error: {0}")]
    Control(#[from] IpcError),

    /// The device was already closed
    #[error("Device closed")]
    Closed,
}
