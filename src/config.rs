//! Configuration for the client core
//!
//! Built from the process environment the same way the service configs in
//! this codebase's lineage are: `.env` is loaded opportunistically, every
//! field has a serde default, and `validate()` rejects unusable
//! combinations at build time instead of panicking later.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    // Logging
    #[serde(default)]
    pub hide_sensitive_data: bool,

    // Retry policy
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_total_retry_duration", deserialize_with = "de_duration")]
    pub total_retry_duration: Duration,
    #[serde(default = "default_retry_eligible")]
    pub retry_eligible: bool,

    // Timeouts
    #[serde(default = "default_custom_timeout", deserialize_with = "de_duration")]
    pub custom_timeout: Duration,
    #[serde(default = "default_connect_timeout", deserialize_with = "de_duration")]
    pub connect_timeout: Duration,

    // Authentication
    #[serde(
        default = "default_token_refresh_buffer",
        deserialize_with = "de_duration"
    )]
    pub token_refresh_buffer_period: Duration,

    // Concurrency
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_enable_concurrency_management")]
    pub enable_concurrency_management: bool,
    #[serde(default)]
    pub enable_dynamic_rate_limiting: bool,
    #[serde(default = "default_zero_duration", deserialize_with = "de_duration")]
    pub mandatory_request_delay: Duration,

    // Redirects
    #[serde(default)]
    pub follow_redirects: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    // Cookies, semicolon-separated name=value pairs
    #[serde(default)]
    pub custom_cookies: String,

    // Circuit breaker (optional protection, off by default)
    #[serde(default)]
    pub circuit_breaker_enabled: bool,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(
        default = "default_circuit_breaker_open_duration",
        deserialize_with = "de_duration"
    )]
    pub circuit_breaker_open_duration: Duration,

    // Transport identity
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_total_retry_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_eligible() -> bool {
    true
}

fn default_custom_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_token_refresh_buffer() -> Duration {
    Duration::from_secs(300)
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_enable_concurrency_management() -> bool {
    true
}

fn default_zero_duration() -> Duration {
    Duration::ZERO
}

fn default_max_redirects() -> usize {
    5
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_open_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("restkit/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hide_sensitive_data: false,
            max_retry_attempts: default_max_retry_attempts(),
            total_retry_duration: default_total_retry_duration(),
            retry_eligible: default_retry_eligible(),
            custom_timeout: default_custom_timeout(),
            connect_timeout: default_connect_timeout(),
            token_refresh_buffer_period: default_token_refresh_buffer(),
            max_concurrent_requests: default_max_concurrent_requests(),
            enable_concurrency_management: default_enable_concurrency_management(),
            enable_dynamic_rate_limiting: false,
            mandatory_request_delay: Duration::ZERO,
            follow_redirects: false,
            max_redirects: default_max_redirects(),
            custom_cookies: String::new(),
            circuit_breaker_enabled: false,
            circuit_breaker_failure_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_open_duration: default_circuit_breaker_open_duration(),
            user_agent: default_user_agent(),
        }
    }
}

/// Accepts either an integer number of seconds or a humantime string
/// ("30s", "5m") for duration-typed environment values.
fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => {
            let trimmed = text.trim();
            if let Ok(secs) = trimmed.parse::<u64>() {
                return Ok(Duration::from_secs(secs));
            }
            humantime::parse_duration(trimmed).map_err(serde::de::Error::custom)
        }
    }
}

impl ClientConfig {
    /// Builds the configuration from the process environment.
    ///
    /// Recognized variables: `HIDE_SENSITIVE_DATA`, `MAX_RETRY_ATTEMPTS`,
    /// `MAX_CONCURRENT_REQUESTS`, `ENABLE_DYNAMIC_RATE_LIMITING`,
    /// `CUSTOM_TIMEOUT`, `TOKEN_REFRESH_BUFFER_PERIOD`,
    /// `TOTAL_RETRY_DURATION`, `FOLLOW_REDIRECTS`, `MAX_REDIRECTS`,
    /// `ENABLE_CONCURRENCY_MANAGEMENT`, `CUSTOM_COOKIES`.
    pub fn from_env() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let cfg: ClientConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects combinations that cannot produce a working client.
    pub fn validate(&self) -> Result<()> {
        if self.enable_concurrency_management && self.max_concurrent_requests < 1 {
            return Err(ClientError::InvalidConfiguration(
                "max_concurrent_requests must be at least 1 when concurrency management is enabled"
                    .to_string(),
            ));
        }
        if self.follow_redirects && self.max_redirects < 1 {
            return Err(ClientError::InvalidConfiguration(
                "max_redirects must be at least 1 when follow_redirects is enabled".to_string(),
            ));
        }
        if self.custom_timeout.is_zero() {
            return Err(ClientError::InvalidConfiguration(
                "custom_timeout must be greater than zero".to_string(),
            ));
        }
        for pair in self.cookie_pairs() {
            if pair.0.is_empty() {
                return Err(ClientError::InvalidConfiguration(format!(
                    "malformed custom cookie entry: '={}'",
                    pair.1
                )));
            }
        }
        Ok(())
    }

    /// Parses `custom_cookies` into name/value pairs. Empty segments are
    /// skipped, a missing '=' yields an empty value.
    pub fn cookie_pairs(&self) -> Vec<(String, String)> {
        self.custom_cookies
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| match s.split_once('=') {
                Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
                None => (s.to_string(), String::new()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.max_concurrent_requests, 10);
        assert_eq!(config.custom_timeout, Duration::from_secs(10));
        assert!(config.retry_eligible);
        assert!(!config.circuit_breaker_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = ClientConfig {
            max_concurrent_requests: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ClientError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_redirect_limit_rejected_when_following() {
        let config = ClientConfig {
            follow_redirects: true,
            max_redirects: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cookie_pairs() {
        let config = ClientConfig {
            custom_cookies: "session=abc; region=eu ;flag".to_string(),
            ..Default::default()
        };
        let pairs = config.cookie_pairs();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("session".to_string(), "abc".to_string()));
        assert_eq!(pairs[1], ("region".to_string(), "eu".to_string()));
        assert_eq!(pairs[2], ("flag".to_string(), String::new()));
    }

    #[test]
    fn test_duration_from_humantime_string() {
        let json = serde_json::json!({ "custom_timeout": "30s" });
        let config: ClientConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.custom_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_duration_from_integer_seconds() {
        let json = serde_json::json!({ "total_retry_duration": 90 });
        let config: ClientConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.total_retry_duration, Duration::from_secs(90));
    }
}
