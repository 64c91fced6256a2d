//! Configuration for the upstream assistant backend

use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;

/// Upstream assistant client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Enable/disable upstream calls globally
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Base URL of the Assistants API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (read from env OPENAI_API_KEY if not set)
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Connect/request timeout in milliseconds for non-streaming calls
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Number of retry attempts for posting a message
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    /// Base backoff in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Circuit breaker failure threshold
    #[serde(default = "default_breaker_failures")]
    pub circuit_breaker_failures: usize,

    /// Circuit breaker reset timeout in seconds
    #[serde(default = "default_breaker_reset")]
    pub circuit_breaker_reset_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> usize {
    2
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_breaker_failures() -> usize {
    5
}

fn default_breaker_reset() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            base_url: default_base_url(),
            api_key: None,
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            circuit_breaker_failures: default_breaker_failures(),
            circuit_breaker_reset_secs: default_breaker_reset(),
        }
    }
}

impl UpstreamConfig {
    /// Override with the conventional OpenAI environment variables
    pub fn from_env(mut self) -> Self {
        if self.api_key.is_none() {
            if let Ok(val) = std::env::var("OPENAI_API_KEY") {
                self.api_key = Some(SecretString::new(val));
            }
        }

        if let Ok(val) = std::env::var("OPENAI_BASE_URL") {
            self.base_url = val;
        }

        if let Ok(val) = std::env::var("UPSTREAM_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.timeout_ms = ms;
            }
        }

        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn breaker_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_reset_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_default_config() {
        let config = UpstreamConfig::default();
        assert!(config.enabled);
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert!(config.api_key.is_none());
        assert_eq!(config.retry_attempts, 2);
    }

    #[test]
    fn test_explicit_key_wins_over_env() {
        std::env::set_var("OPENAI_API_KEY", "from-env");

        let config = UpstreamConfig {
            api_key: Some(SecretString::new("explicit".to_string())),
            ..Default::default()
        }
        .from_env();
        assert_eq!(config.api_key.unwrap().expose_secret(), "explicit");

        std::env::remove_var("OPENAI_API_KEY");
    }

    #[test]
    fn test_duration_conversions() {
        let config = UpstreamConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(30_000));
        assert_eq!(config.retry_backoff(), Duration::from_millis(200));
        assert_eq!(config.breaker_reset_timeout(), Duration::from_secs(30));
    }
}
