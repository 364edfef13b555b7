//! Logging module for embedtun.
//!
//! This module provides structured logging using the `tracing` crate. A host
//! process that loads the tunnel library usually owns stdout, so diagnostics
//! default to a log file. Records emitted through the `log` facade (the
//! control IPC crate, the interface provider) are bridged into `tracing`.

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::Config;

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Whether to log to stdout (default: false)
    pub log_to_stdout: bool,

    /// Whether to log to a file (default: true)
    pub log_to_file: bool,

    /// Directory to store the log file
    pub log_dir: PathBuf,

    /// Log file name (default: "embedtun.log")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: true)
    pub include_file_line: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        let logging = crate::config::LoggingConfig::default();
        LogOptions {
            level: Level::INFO,
            log_to_stdout: false,
            log_to_file: true,
            log_dir: logging.dir,
            log_file_name: logging.file_name,
            json_format: false,
            include_file_line: true,
        }
    }
}

/// Parse a level name, falling back to INFO for anything unrecognized.
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive for as long as records should
/// reach the log file. Installing the global subscriber is best-effort: if
/// the host already installed one, it is left in place.
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // Bridge `log` crate records into `tracing`
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());

    let mut layers = Vec::new();
    let mut guard = None;

    if options.log_to_stdout {
        let stdout_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true);

        let stdout_layer = if options.json_format {
            stdout_layer.json().boxed()
        } else {
            stdout_layer.boxed()
        };

        layers.push(stdout_layer);
    }

    if options.log_to_file {
        if let Err(e) = std::fs::create_dir_all(&options.log_dir) {
            eprintln!(
                "embedtun: cannot create log directory {}: {}",
                options.log_dir.display(),
                e
            );
        } else {
            let file_appender =
                tracing_appender::rolling::never(&options.log_dir, &options.log_file_name);

            let (non_blocking, worker_guard) = NonBlocking::new(file_appender);
            guard = Some(worker_guard);

            let file_layer = fmt::layer()
                .with_file(options.include_file_line)
                .with_line_number(options.include_file_line)
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking);

            let file_layer = if options.json_format {
                file_layer.json().boxed()
            } else {
                file_layer.boxed()
            };

            layers.push(file_layer);
        }
    }

    // Set the global subscriber (ignore if already set in this process)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

/// Initialize logging from a configuration.
pub fn init_logging_from_config(config: &Config) -> Option<WorkerGuard> {
    let options = LogOptions {
        level: parse_level(&config.log_level),
        log_to_stdout: config.logging.to_stdout,
        log_to_file: config.logging.to_file,
        log_dir: config.logging.dir.clone(),
        log_file_name: config.logging.file_name.clone(),
        json_format: config.logging.json,
        ..Default::default()
    };

    init_logging(options)
}
