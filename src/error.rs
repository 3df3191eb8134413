//! Error types for the client core

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("token acquisition failed: {0}")]
    TokenAcquisition(String),

    #[error("token refresh buffer exceeds the token lifetime granted by the server")]
    RefreshBufferTooLarge,

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("no request permit available within {0:?}")]
    PermitTimeout(Duration),

    #[error("retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("transient server error: {status}")]
    Transient { status: u16 },

    #[error("rate limited by server (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("redirect limit exceeded")]
    RedirectLimit,

    #[error("request body serialization failed: {0}")]
    Serialization(String),

    #[error("response handling failed: {0}")]
    ResponseHandling(String),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),
}

impl ClientError {
    /// True for errors the idempotent retry loop is allowed to recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transient { .. } | ClientError::RateLimited { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
