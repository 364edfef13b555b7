//! Configuration management module for embedtun.
//!
//! This module provides functionality for loading, parsing, and managing the
//! settings a host process embeds the tunnel manager with: where diagnostics
//! go, which MTU interfaces are requested with, and where control sockets live.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming a TOML configuration file
pub const CONFIG_PATH_ENV: &str = "EMBEDTUN_CONFIG";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Diagnostic log settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Mirror log records to stdout (default: false, the host owns stdout)
    #[serde(default)]
    pub to_stdout: bool,

    /// Write log records to a file (default: true)
    #[serde(default = "default_true")]
    pub to_file: bool,

    /// Directory holding the log file
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// Log file name (default: "embedtun.log")
    #[serde(default = "default_log_file_name")]
    pub file_name: String,

    /// Emit JSON records instead of text (default: false)
    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("embedtun")
        .join("logs")
}

fn default_log_file_name() -> String {
    "embedtun.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            to_stdout: false,
            to_file: default_true(),
            dir: default_log_dir(),
            file_name: default_log_file_name(),
            json: false,
        }
    }
}

/// Tunnel lifecycle settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelDefaults {
    /// MTU requested when provisioning an interface (default: 1420)
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Directory holding per-interface control sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Worker threads of the manager's runtime (default: 2)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// How long shutdown waits for acceptors to stop, in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_mtu() -> u32 {
    1420
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/run/wireguard")
}

fn default_worker_threads() -> usize {
    2
}

fn default_shutdown_timeout_ms() -> u64 {
    2_000
}

impl Default for TunnelDefaults {
    fn default() -> Self {
        TunnelDefaults {
            mtu: default_mtu(),
            socket_dir: default_socket_dir(),
            worker_threads: default_worker_threads(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl TunnelDefaults {
    /// Returns the shutdown timeout as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Main configuration structure for embedtun.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Diagnostic log configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tunnel lifecycle configuration
    #[serde(default)]
    pub tunnel: TunnelDefaults,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            logging: LoggingConfig::default(),
            tunnel: TunnelDefaults::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate()?;

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Build the configuration a host process gets without passing one
    /// explicitly: the file named by `EMBEDTUN_CONFIG` if set, defaults
    /// otherwise, with environment overrides applied either way.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => {
                let mut config = Config::default();
                config.apply_overrides(|key| std::env::var(key).ok());
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "log_level".to_string(),
                    message: format!("unknown level {:?}", other),
                });
            }
        }

        if self.logging.file_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "logging.file_name".to_string(),
                message: "log file name cannot be empty".to_string(),
            });
        }

        if !(576..=65_535).contains(&self.tunnel.mtu) {
            return Err(ConfigError::InvalidValue {
                key: "tunnel.mtu".to_string(),
                message: format!("{} is outside 576..=65535", self.tunnel.mtu),
            });
        }

        if self.tunnel.socket_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "tunnel.socket_dir".to_string(),
                message: "socket directory cannot be empty".to_string(),
            });
        }

        if self.tunnel.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                key: "tunnel.worker_threads".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Apply overrides (prefix: EMBEDTUN_) read through `lookup`.
    ///
    /// Keys: EMBEDTUN_LOG_LEVEL, EMBEDTUN_LOG_DIR, EMBEDTUN_SOCKET_DIR,
    /// EMBEDTUN_MTU, EMBEDTUN_WORKER_THREADS. Unparseable numbers are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EMBEDTUN_LOG_LEVEL") {
            if !v.is_empty() {
                self.log_level = v;
            }
        }
        if let Some(v) = lookup("EMBEDTUN_LOG_DIR") {
            if !v.is_empty() {
                self.logging.dir = PathBuf::from(v);
            }
        }
        if let Some(v) = lookup("EMBEDTUN_SOCKET_DIR") {
            if !v.is_empty() {
                self.tunnel.socket_dir = PathBuf::from(v);
            }
        }
        if let Some(n) = lookup("EMBEDTUN_MTU").and_then(|v| v.parse().ok()) {
            self.tunnel.mtu = n;
        }
        if let Some(n) = lookup("EMBEDTUN_WORKER_THREADS").and_then(|v| v.parse().ok()) {
            self.tunnel.worker_threads = n;
        }
    }
}
