//! # Configuration Management
//!
//! Centralized configuration for the network engine.
//!
//! This module provides structured configuration for servers and clients,
//! including listen addresses, receive buffer sizing, flood ceilings, dispatch
//! queue capacity and logging output.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - TOML strings via [`NetworkConfig::from_toml`]
//! - `NETWORK_ENGINE_*` environment variables via [`NetworkConfig::from_env`]
//! - Direct instantiation with defaults and overrides
//!
//! ## Security Considerations
//! - `max_payload_size` bounds the memory a single frame may claim
//! - `max_receives_per_second` disconnects flooding peers (0 disables it)
//! - `max_connections` caps the per-server connection table
//! - `outbound_queue_capacity` bounds what a peer that stops reading can pin

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default size of the fixed per-entity receive buffer
pub const NETWORK_BUFFER_LENGTH: usize = 8 * 1024;

/// Max allowed payload size (e.g. 16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default receive-event ceiling per rolling second
pub const MAX_RECEIVES_PER_SECOND: u32 = 1000;

/// Default bound of a connection's dispatch queue
pub const DISPATCH_QUEUE_CAPACITY: usize = 256;

/// Default number of frames waiting for a stream socket's writer
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Wire protocol and receive path configuration
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    ///
    /// Unset variables keep their defaults; unparsable values are rejected.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("NETWORK_ENGINE_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("NETWORK_ENGINE_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Some(val) = env_parse::<usize>("NETWORK_ENGINE_MAX_CONNECTIONS")? {
            config.server.max_connections = val;
        }

        if let Some(val) = env_parse::<usize>("NETWORK_ENGINE_WORKER_COUNT")? {
            config.client.worker_count = val;
        }

        if let Some(val) = env_parse::<u64>("NETWORK_ENGINE_CONNECT_TIMEOUT_MS")? {
            config.client.connect_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<usize>("NETWORK_ENGINE_BUFFER_LENGTH")? {
            config.protocol.network_buffer_length = val;
        }

        if let Some(val) = env_parse::<usize>("NETWORK_ENGINE_MAX_PAYLOAD_SIZE")? {
            config.protocol.max_payload_size = val;
        }

        if let Some(val) = env_parse::<u32>("NETWORK_ENGINE_MAX_RECEIVES_PER_SECOND")? {
            config.protocol.max_receives_per_second = val;
        }

        if let Some(val) = env_parse::<usize>("NETWORK_ENGINE_DISPATCH_QUEUE_CAPACITY")? {
            config.protocol.dispatch_queue_capacity = val;
        }

        if let Some(val) = env_parse::<usize>("NETWORK_ENGINE_OUTBOUND_QUEUE_CAPACITY")? {
            config.protocol.outbound_queue_capacity = val;
        }

        if let Ok(level) = std::env::var("NETWORK_ENGINE_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.protocol.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Maximum number of live connections per server
    pub max_connections: usize,

    /// Set TCP_NODELAY on accepted sockets
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            max_connections: 1000,
            nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Workers in the shared client dispatch pool
    pub worker_count: usize,

    /// Request path sent in the WebSocket upgrade
    pub websocket_path: String,

    /// Timeout for connection attempts (including the WebSocket upgrade)
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Set TCP_NODELAY on the client socket
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            worker_count: 4,
            websocket_path: String::from("/"),
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '127.0.0.1:8080')",
                self.address
            ));
        }

        if self.worker_count == 0 {
            errors.push("Worker count must be greater than 0".to_string());
        } else if self.worker_count > 1024 {
            errors.push(format!(
                "Worker count too large: {} (maximum: 1024)",
                self.worker_count
            ));
        }

        if !self.websocket_path.starts_with('/') {
            errors.push(format!(
                "WebSocket path must start with '/': '{}'",
                self.websocket_path
            ));
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Wire protocol and receive path configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Size of the fixed receive buffer owned by each entity
    pub network_buffer_length: usize,

    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,

    /// Receive events per rolling second before a `Spam` disconnect (0 disables)
    pub max_receives_per_second: u32,

    /// Bound of each connection's dispatch queue
    pub dispatch_queue_capacity: usize,

    /// Frames queued for a stream socket before a send fails with `InvalidMessageSent`
    pub outbound_queue_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            network_buffer_length: NETWORK_BUFFER_LENGTH,
            max_payload_size: MAX_PAYLOAD_SIZE,
            max_receives_per_second: MAX_RECEIVES_PER_SECOND,
            dispatch_queue_capacity: DISPATCH_QUEUE_CAPACITY,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl ProtocolConfig {
    /// Validate protocol configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.network_buffer_length < 64 {
            errors.push(format!(
                "Network buffer too small: {} bytes (minimum: 64)",
                self.network_buffer_length
            ));
        } else if self.network_buffer_length > 64 * 1024 * 1024 {
            errors.push(format!(
                "Network buffer too large: {} bytes (maximum: 64 MB)",
                self.network_buffer_length
            ));
        }

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.dispatch_queue_capacity == 0 {
            errors.push("Dispatch queue capacity must be greater than 0".to_string());
        } else if self.dispatch_queue_capacity > 1_000_000 {
            errors.push(format!(
                "Dispatch queue capacity too large: {} (max recommended: 1,000,000)",
                self.dispatch_queue_capacity
            ));
        }

        if self.outbound_queue_capacity == 0 {
            errors.push("Outbound queue capacity must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("network-engine"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            [protocol]
            max_receives_per_second = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.protocol.max_receives_per_second, 5);
        assert_eq!(config.protocol.max_payload_size, MAX_PAYLOAD_SIZE);
        assert_eq!(
            config.protocol.outbound_queue_capacity,
            OUTBOUND_QUEUE_CAPACITY
        );
        assert_eq!(config.server.address, "127.0.0.1:9000");
    }

    #[test]
    fn test_example_config_round_trips() {
        let text = NetworkConfig::example_config();
        let parsed = NetworkConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.client.connect_timeout, Duration::from_secs(5));
        assert_eq!(parsed.logging.log_level, Level::INFO);
    }
}
