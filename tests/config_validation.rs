//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use network_engine::config::{NetworkConfig, MAX_PAYLOAD_SIZE};
use network_engine::error::ProtocolError;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_client_address() {
    let mut config = NetworkConfig::default();
    config.client.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_zero_worker_count() {
    let mut config = NetworkConfig::default();
    config.client.worker_count = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Worker count must be greater than 0")));
}

#[test]
fn test_websocket_path_must_be_absolute() {
    let mut config = NetworkConfig::default();
    config.client.websocket_path = "chat".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("must start with '/'")));
}

#[test]
fn test_short_connect_timeout() {
    let mut config = NetworkConfig::default();
    config.client.connect_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Connect timeout too short")));
}

#[test]
fn test_tiny_network_buffer() {
    let mut config = NetworkConfig::default();
    config.protocol.network_buffer_length = 16;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Network buffer too small")));
}

#[test]
fn test_zero_payload_size() {
    let mut config = NetworkConfig::default();
    config.protocol.max_payload_size = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max payload size cannot be 0")));
}

#[test]
fn test_zero_receive_rate_is_allowed() {
    let mut config = NetworkConfig::default();
    config.protocol.max_receives_per_second = 0;
    assert!(config.validate().is_empty());
}

#[test]
fn test_zero_outbound_queue_is_rejected() {
    let mut config = NetworkConfig::default();
    config.protocol.outbound_queue_capacity = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Outbound queue capacity")));
}

#[test]
fn test_file_logging_requires_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_output() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_multiple_errors_are_collected() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();
    config.client.worker_count = 0;
    config.protocol.dispatch_queue_capacity = 0;

    assert!(config.validate().len() >= 3);
    match config.validate_strict() {
        Err(ProtocolError::ConfigError(message)) => {
            assert!(message.contains("Configuration validation failed"));
        }
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn test_toml_overrides_and_defaults() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        address = "0.0.0.0:7000"
        max_connections = 2

        [client]
        connect_timeout = 1500
        websocket_path = "/ws"

        [logging]
        log_level = "debug"
        "#,
    )
    .expect("valid toml");

    assert_eq!(config.server.address, "0.0.0.0:7000");
    assert_eq!(config.server.max_connections, 2);
    assert_eq!(config.client.connect_timeout, Duration::from_millis(1500));
    assert_eq!(config.client.websocket_path, "/ws");
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert_eq!(config.protocol.max_payload_size, MAX_PAYLOAD_SIZE);
}

#[test]
fn test_malformed_toml_is_config_error() {
    let err = NetworkConfig::from_toml("[server\naddress = ").unwrap_err();
    assert!(matches!(err, ProtocolError::ConfigError(_)));
}

#[test]
fn test_save_and_reload() {
    let path = std::env::temp_dir().join(format!(
        "network-engine-config-{}.toml",
        std::process::id()
    ));
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.max_connections = 42;
        c.client.worker_count = 8;
    });
    config.save_to_file(&path).expect("save");

    let reloaded = NetworkConfig::from_file(&path).expect("reload");
    assert_eq!(reloaded.server.max_connections, 42);
    assert_eq!(reloaded.client.worker_count, 8);
    let _ = std::fs::remove_file(&path);
}
