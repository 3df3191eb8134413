//! Client construction and transport ownership
//!
//! The [`Client`] owns its HTTP transport, concurrency governor and token
//! manager; the vendor [`Integration`] is shared by reference. Building is
//! fallible: configuration and credential problems surface here, never as
//! a failed first request.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::credentials::Credentials;
use crate::auth::TokenManager;
use crate::circuit_breaker::CircuitBreaker;
use crate::concurrency::{ConcurrencyGovernor, RequestMetrics};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::integration::Integration;

/// Resilient HTTP client for one backend API.
///
/// Safe for concurrent use; clone an `Arc<Client>` into as many tasks as
/// needed. Every request flows through the same admission gate, token
/// manager and retry machinery.
pub struct Client {
    pub(crate) http: reqwest::Client,
    pub(crate) config: ClientConfig,
    pub(crate) integration: Arc<dyn Integration>,
    pub(crate) governor: Arc<ConcurrencyGovernor>,
    pub(crate) auth: TokenManager,
    pub(crate) breaker: Option<CircuitBreaker>,
    pub(crate) pacing: Option<DefaultDirectRateLimiter>,
    pub(crate) cookie_header: Option<String>,
    http_timeout: RwLock<Duration>,
    evaluator: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Per-request timeout currently in effect.
    pub fn http_timeout(&self) -> Duration {
        *self.http_timeout.read()
    }

    /// Overrides the per-request timeout for subsequent requests.
    pub fn modify_http_timeout(&self, timeout: Duration) {
        info!(timeout_ms = timeout.as_millis() as u64, "http timeout modified");
        *self.http_timeout.write() = timeout;
    }

    /// Restores the configured per-request timeout.
    pub fn reset_timeout(&self) {
        *self.http_timeout.write() = self.config.custom_timeout;
    }

    /// Snapshot of the performance counters.
    pub fn metrics(&self) -> RequestMetrics {
        self.governor.metrics()
    }

    /// Current admission capacity (moves when dynamic rate limiting is on).
    pub fn concurrency_limit(&self) -> usize {
        self.governor.capacity()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(evaluator) = &self.evaluator {
            evaluator.abort();
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    integration: Option<Arc<dyn Integration>>,
    credentials: Option<Credentials>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            integration: None,
            credentials: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn integration(mut self, integration: Arc<dyn Integration>) -> Self {
        self.integration = Some(integration);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Validates everything and assembles the client.
    pub fn build(self) -> Result<Client> {
        let config = self.config;
        config.validate()?;

        let integration = self.integration.ok_or_else(|| {
            ClientError::InvalidConfiguration("an Integration is required".to_string())
        })?;
        let credentials = self.credentials.ok_or_else(|| {
            ClientError::InvalidCredentials("credentials are required".to_string())
        })?;

        let redirect = if config.follow_redirects {
            reqwest::redirect::Policy::limited(config.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .redirect(redirect)
            .gzip(true)
            .brotli(true)
            .build()?;

        let auth = TokenManager::new(
            http.clone(),
            integration.clone(),
            credentials,
            config.token_refresh_buffer_period,
            config.hide_sensitive_data,
        )?;

        let governor = Arc::new(ConcurrencyGovernor::new(config.max_concurrent_requests));
        let evaluator = if config.enable_concurrency_management
            && config.enable_dynamic_rate_limiting
        {
            if tokio::runtime::Handle::try_current().is_ok() {
                Some(governor.spawn_evaluator())
            } else {
                warn!("no tokio runtime at build time, dynamic rate limiting disabled");
                None
            }
        } else {
            None
        };

        let breaker = config.circuit_breaker_enabled.then(|| {
            CircuitBreaker::new(
                config.circuit_breaker_failure_threshold,
                config.circuit_breaker_open_duration,
            )
        });

        let pacing = (!config.mandatory_request_delay.is_zero())
            .then(|| Quota::with_period(config.mandatory_request_delay))
            .flatten()
            .map(RateLimiter::direct);

        let cookie_header = {
            let pairs = config.cookie_pairs();
            (!pairs.is_empty()).then(|| {
                pairs
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            })
        };

        let http_timeout = RwLock::new(config.custom_timeout);

        Ok(Client {
            http,
            config,
            integration,
            governor,
            auth,
            breaker,
            pacing,
            cookie_header,
            http_timeout,
            evaluator,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
