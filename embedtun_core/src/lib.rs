//! Core library for embedtun.
//!
//! This crate provides the tunnel lifecycle manager embedded by host
//! processes, together with its configuration, logging setup and the
//! translation of tunnel documents into device configuration.

pub mod config;
pub mod logging;
pub mod settings;
pub mod tunnel;

// Re-export commonly used items for convenience
pub use config::{Config, ConfigError};
pub use settings::{SettingsError, TunnelSettings};
pub use tunnel::{TunnelError, TunnelHandle, TunnelManager, TunnelResult, FAILURE_SENTINEL};
