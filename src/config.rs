//! Service configuration
//!
//! Loaded from an optional TOML file, then overridden by `TURN_RELAY__*`
//! environment variables (`TURN_RELAY__SERVER__PORT=9000`).

use crate::chat::TurnSettings;
use crate::error::Result;
use crate::upstream::UpstreamConfig;
use serde::Deserialize;
use std::time::Duration;

const ENV_PREFIX: &str = "TURN_RELAY";

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted request body size
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Streaming turn configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Wall-clock ceiling for one turn
    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_secs: u64,
    /// Frames buffered between the session and the response body
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_turn_timeout() -> u64 {
    300
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            turn_timeout_secs: default_turn_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// History commit configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: usize,
}

fn default_max_commit_attempts() -> usize {
    3
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: default_max_commit_attempts(),
        }
    }
}

/// In-memory store configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// JSON fixture of conversations and ledgers loaded at startup
    #[serde(default)]
    pub seed_path: Option<String>,
}

impl Config {
    /// Load from `path` (if it exists) and the environment
    pub fn load(path: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(Config {
            upstream: config.upstream.from_env(),
            ..config
        })
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            turn_timeout: Duration::from_secs(self.stream.turn_timeout_secs),
            channel_capacity: self.stream.channel_capacity,
            max_commit_attempts: self.history.max_commit_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.stream.turn_timeout_secs, 300);
        assert_eq!(config.history.max_commit_attempts, 3);
        assert!(config.store.seed_path.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [server]
            port = 9000

            [upstream]
            base_url = "http://localhost:4010/v1"
            retry_attempts = 0

            [stream]
            turn_timeout_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.upstream.base_url, "http://localhost:4010/v1");
        assert_eq!(config.upstream.retry_attempts, 0);
        assert_eq!(config.upstream.circuit_breaker_failures, 5);
        assert_eq!(config.stream.channel_capacity, 64);

        let settings = config.turn_settings();
        assert_eq!(settings.turn_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = Config::from_toml_str("[server]\nport = \"not a number\"");
        assert!(matches!(result, Err(crate::error::RelayError::Config(_))));
    }
}
