use embedtun_core::config::{Config, ConfigError};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

#[test]
fn test_load_full_config() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        log_level = "debug"

        [logging]
        to_stdout = true
        to_file = false
        dir = "/tmp/embedtun-logs"
        file_name = "tunnel.log"
        json = true

        [tunnel]
        mtu = 1380
        socket_dir = "/tmp/embedtun-sockets"
        worker_threads = 4
        shutdown_timeout_ms = 500
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "debug");
    assert!(config.logging.to_stdout);
    assert!(!config.logging.to_file);
    assert_eq!(config.logging.dir, PathBuf::from("/tmp/embedtun-logs"));
    assert_eq!(config.logging.file_name, "tunnel.log");
    assert!(config.logging.json);
    assert_eq!(config.tunnel.mtu, 1380);
    assert_eq!(config.tunnel.socket_dir, PathBuf::from("/tmp/embedtun-sockets"));
    assert_eq!(config.tunnel.worker_threads, 4);
    assert_eq!(config.tunnel.shutdown_timeout().as_millis(), 500);
}

#[test]
fn test_load_partial_config_uses_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[tunnel]\nmtu = 1280\n").unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "info");
    assert!(config.logging.to_file);
    assert_eq!(config.logging.file_name, "embedtun.log");
    assert_eq!(config.tunnel.mtu, 1280);
    assert_eq!(config.tunnel.worker_threads, 2);
}

#[test]
fn test_load_invalid_mtu() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[tunnel]\nmtu = 100\n").unwrap();

    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[test]
fn test_load_malformed_toml() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"log_level = \n").unwrap();

    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::TomlError(_))));
}

#[test]
fn test_load_missing_file() {
    let result = Config::load("/nonexistent/embedtun.toml");
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn test_save_and_reload() {
    let file = NamedTempFile::new().unwrap();

    let mut config = Config::default();
    config.log_level = "warn".to_string();
    config.tunnel.mtu = 1400;
    config.save(file.path()).unwrap();

    let loaded = Config::load(file.path()).unwrap();
    assert_eq!(loaded.log_level, "warn");
    assert_eq!(loaded.tunnel.mtu, 1400);
}
