//! Authentication lifecycle
//!
//! Acquires, caches, validates and refreshes tokens transparently behind
//! [`TokenManager::ensure_valid`]. The credential strategy is fixed once at
//! build time; the manager only decides *when* to talk to the token
//! endpoint, the wire flows live in `bearer` and `oauth`.

pub mod credentials;

mod bearer;
mod oauth;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::integration::Integration;
use credentials::{BasicCredentials, Credentials, OAuthCredentials};

const TOKEN_REFRESH_MAX_ATTEMPTS: u32 = 5;
const TOKEN_REFRESH_INITIAL_INTERVAL: Duration = Duration::from_millis(100);
// Consecutive reacquisitions that never reach freshness before the
// buffer-too-large guard fires.
const MAX_CONSECUTIVE_STALE_REFRESHES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Bearer,
    OAuth2,
}

/// Cached token material; owned exclusively by the manager.
#[derive(Debug, Clone)]
pub struct TokenState {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub kind: TokenKind,
}

impl TokenState {
    /// A token is usable only while it outlives the refresh buffer.
    fn is_fresh(&self, buffer: Duration) -> bool {
        if self.value.is_empty() {
            return false;
        }
        let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::MAX);
        self.expires_at - Utc::now() > buffer
    }
}

#[derive(Debug)]
enum AuthStrategy {
    Bearer(BasicCredentials),
    OAuth(OAuthCredentials),
}

struct TokenCell {
    token: Option<TokenState>,
    stale_refreshes: u32,
}

/// Owns the token lifecycle for one client.
///
/// `ensure_valid` is the single contract the executor calls before a
/// request goes out; it is serialized by an async mutex so concurrent
/// callers see the first caller's refresh outcome.
pub struct TokenManager {
    http: reqwest::Client,
    integration: Arc<dyn Integration>,
    strategy: AuthStrategy,
    buffer: Duration,
    hide_sensitive: bool,
    cell: Mutex<TokenCell>,
}

impl TokenManager {
    /// Validates the credentials and fixes the strategy. Fails at build
    /// time, never at first request.
    pub fn new(
        http: reqwest::Client,
        integration: Arc<dyn Integration>,
        credentials: Credentials,
        buffer: Duration,
        hide_sensitive: bool,
    ) -> Result<Self> {
        credentials.validate()?;
        let strategy = match credentials {
            Credentials::OAuthClientCredentials(creds) => AuthStrategy::OAuth(creds),
            Credentials::Basic(creds) => AuthStrategy::Bearer(creds),
        };
        Ok(Self {
            http,
            integration,
            strategy,
            buffer,
            hide_sensitive,
            cell: Mutex::new(TokenCell {
                token: None,
                stale_refreshes: 0,
            }),
        })
    }

    /// Guarantees a token that outlives the refresh buffer, acquiring or
    /// refreshing as needed.
    ///
    /// Each acquisition attempt is retried up to five times with an
    /// exponential schedule starting at 100ms. When the server keeps
    /// granting tokens whose lifetime is already inside the buffer, the
    /// storm guard fails with [`ClientError::RefreshBufferTooLarge`]
    /// instead of refreshing forever.
    pub async fn ensure_valid(&self) -> Result<()> {
        let mut cell = self.cell.lock().await;

        if let Some(token) = &cell.token {
            if token.is_fresh(self.buffer) {
                return Ok(());
            }
            debug!(
                auth_method = %self.integration.auth_method_descriptor(),
                "cached token inside refresh buffer, reacquiring"
            );
        }

        loop {
            let token = self.acquire_token_with_retries().await?;
            let fresh = token.is_fresh(self.buffer);
            if self.hide_sensitive {
                debug!(auth_method = %self.integration.auth_method_descriptor(), "token acquired");
            } else {
                debug!(
                    auth_method = %self.integration.auth_method_descriptor(),
                    expires_at = %token.expires_at,
                    "token acquired"
                );
            }
            cell.token = Some(token);

            if fresh {
                cell.stale_refreshes = 0;
                return Ok(());
            }

            cell.stale_refreshes += 1;
            warn!(
                stale_refreshes = cell.stale_refreshes,
                buffer_secs = self.buffer.as_secs(),
                "freshly acquired token already falls inside the refresh buffer"
            );
            if cell.stale_refreshes > MAX_CONSECUTIVE_STALE_REFRESHES {
                cell.stale_refreshes = 0;
                return Err(ClientError::RefreshBufferTooLarge);
            }
        }
    }

    /// Installs `Authorization: Bearer <token>`, adding the prefix exactly
    /// once regardless of how the token was stored.
    pub async fn authorize(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let cell = self.cell.lock().await;
        let Some(token) = &cell.token else {
            return Err(ClientError::TokenAcquisition(
                "no token available; ensure_valid must run first".to_string(),
            ));
        };
        let bare = token.value.trim_start_matches("Bearer ").trim();
        Ok(builder.header(reqwest::header::AUTHORIZATION, format!("Bearer {bare}")))
    }

    async fn acquire_token_with_retries(&self) -> Result<TokenState> {
        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(TOKEN_REFRESH_INITIAL_INTERVAL)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        let mut last_error = None;
        for attempt in 1..=TOKEN_REFRESH_MAX_ATTEMPTS {
            match self.request_token().await {
                Ok(token) => return Ok(token),
                Err(err) => {
                    warn!(
                        attempt = attempt,
                        error = %err,
                        "token acquisition attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < TOKEN_REFRESH_MAX_ATTEMPTS {
                        let delay = schedule
                            .next_backoff()
                            .unwrap_or(TOKEN_REFRESH_INITIAL_INTERVAL);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ClientError::TokenAcquisition("token acquisition never attempted".to_string())
        }))
    }

    async fn request_token(&self) -> Result<TokenState> {
        match &self.strategy {
            AuthStrategy::Bearer(creds) => {
                bearer::request_token(
                    &self.http,
                    self.integration.as_ref(),
                    &creds.username,
                    &creds.password,
                )
                .await
            }
            AuthStrategy::OAuth(creds) => {
                oauth::request_token(
                    &self.http,
                    self.integration.as_ref(),
                    &creds.client_id,
                    &creds.client_secret,
                    creds.scope.as_deref(),
                )
                .await
            }
        }
    }
}
