//! Request execution
//!
//! Orchestrates one call end to end: token validation, admission, payload
//! marshaling, dispatch, classification and the retry state machine.
//! Idempotent methods loop on retryable categories inside a wall-clock
//! budget; non-idempotent methods send exactly once and surface the error.

use futures::TryStreamExt;
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backoff::calculate_backoff;
use crate::client::Client;
use crate::concurrency::ConcurrencyGovernor;
use crate::error::{ClientError, Result};
use crate::response::{check_deprecation, classify, rate_limit_wait, ResponseCategory};

/// Methods whose repeated execution is defined by RFC 7231 to have the
/// same observable effect as a single one. PATCH is deliberately absent.
pub fn is_idempotent(method: &Method) -> bool {
    [
        Method::GET,
        Method::PUT,
        Method::DELETE,
        Method::HEAD,
        Method::OPTIONS,
        Method::TRACE,
    ]
    .contains(method)
}

/// Releases the permit on every exit path, including panics and early
/// returns.
pub(crate) struct PermitGuard<'a> {
    governor: &'a ConcurrencyGovernor,
    id: Uuid,
}

impl<'a> PermitGuard<'a> {
    pub(crate) fn new(governor: &'a ConcurrencyGovernor, id: Uuid) -> Self {
        Self { governor, id }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        self.governor.release(self.id);
    }
}

impl Client {
    /// Performs a standard JSON/XML request against the backend.
    ///
    /// Returns the raw HTTP response for success, reported-redirect and
    /// not-found outcomes; the caller inspects the status. Non-retryable
    /// server responses are routed through the integration's error handler
    /// and surface as errors.
    pub async fn do_request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Response> {
        self.auth.ensure_valid().await?;

        if let Some(breaker) = &self.breaker {
            if !breaker.allow_request() {
                return Err(ClientError::CircuitOpen);
            }
        }

        let (_guard, request_id) = self.admit().await?;

        let payload = self
            .integration
            .marshal_request(body, &method, endpoint)?;
        let url = self.integration.construct_resource_url(endpoint)?;

        if let Some(pacing) = &self.pacing {
            pacing.until_ready().await;
        }

        let outcome = if self.config.retry_eligible && is_idempotent(&method) {
            self.execute_with_retries(&method, &url, &payload, body.is_some(), endpoint, request_id)
                .await
        } else {
            self.execute_single(&method, &url, &payload, body.is_some(), endpoint, request_id)
                .await
        };

        if let Some(breaker) = &self.breaker {
            match &outcome {
                Ok(_) => breaker.record_success(),
                Err(
                    ClientError::Api { .. }
                    | ClientError::Transient { .. }
                    | ClientError::RateLimited { .. }
                    | ClientError::RetryExhausted { .. }
                    | ClientError::HttpError(_),
                ) => breaker.record_failure(),
                Err(_) => {}
            }
        }
        outcome
    }

    /// Convenience wrapper that routes the 2xx payload through the
    /// integration's deserializer and maps it onto `T`.
    pub async fn do_request_into<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let response = self.do_request(method, endpoint, body).await?;
        if !response.status().is_success() {
            return Err(self.integration.handle_error_response(response).await);
        }
        let value = self.integration.handle_success_response(response).await?;
        serde_json::from_value(value).map_err(|err| ClientError::ResponseHandling(err.to_string()))
    }

    /// Performs one authenticated request and streams the 2xx body into
    /// the sink. Non-2xx responses go through the integration's error
    /// handler without touching the sink. Returns the bytes written.
    pub async fn do_download<W>(
        &self,
        method: Method,
        endpoint: &str,
        sink: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.auth.ensure_valid().await?;
        let (_guard, request_id) = self.admit().await?;
        let url = self.integration.construct_resource_url(endpoint)?;

        if let Some(pacing) = &self.pacing {
            pacing.until_ready().await;
        }

        let started = Instant::now();
        let builder = self.build_request(&method, &url, &[], false).await?;
        let response = builder.send().await?;
        let category = classify(response.status());
        self.governor.observe(category, started.elapsed());

        if !response.status().is_success() {
            return Err(self.integration.handle_error_response(response).await);
        }

        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.try_next().await? {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        debug!(
            request_id = %request_id,
            bytes = written,
            "download complete"
        );
        Ok(written)
    }

    /// Small-multipart path: the integration encodes the whole body in
    /// memory and the request runs single-shot. POST and PUT only.
    pub async fn do_inline_multipart_request(
        &self,
        method: Method,
        endpoint: &str,
        fields: &[(String, String)],
        files: &[(String, Vec<u8>)],
    ) -> Result<Response> {
        if method != Method::POST && method != Method::PUT {
            return Err(ClientError::InvalidConfiguration(format!(
                "multipart requests support POST and PUT only, got {method}"
            )));
        }
        self.auth.ensure_valid().await?;
        let (_guard, request_id) = self.admit().await?;
        let url = self.integration.construct_resource_url(endpoint)?;

        if let Some(pacing) = &self.pacing {
            pacing.until_ready().await;
        }

        let (payload, content_type) = self.integration.marshal_multipart(fields, files)?;
        let started = Instant::now();
        let builder = self
            .build_request(&method, &url, &[], false)
            .await?
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(payload);
        let response = builder.send().await?;
        let category = classify(response.status());
        self.governor.observe(category, started.elapsed());
        check_deprecation(response.headers(), endpoint);

        match category {
            ResponseCategory::Success
            | ResponseCategory::Redirect
            | ResponseCategory::NotFound => {
                debug!(request_id = %request_id, "inline multipart complete");
                Ok(response)
            }
            ResponseCategory::NonRetryable => {
                Err(self.integration.handle_error_response(response).await)
            }
            ResponseCategory::RateLimit => Err(ClientError::RateLimited {
                retry_after: rate_limit_wait(response.headers()),
            }),
            ResponseCategory::Transient => Err(ClientError::Transient {
                status: response.status().as_u16(),
            }),
        }
    }

    /// Admission through the concurrency gate, skipped entirely when
    /// concurrency management is disabled. The returned id correlates the
    /// request's log lines either way.
    pub(crate) async fn admit(&self) -> Result<(Option<PermitGuard<'_>>, Uuid)> {
        if self.config.enable_concurrency_management {
            let id = self.governor.acquire(None).await?;
            Ok((Some(PermitGuard::new(&self.governor, id)), id))
        } else {
            Ok((None, Uuid::new_v4()))
        }
    }

    /// Assembles one attempt: vendor headers, authorization, cookies,
    /// per-request timeout and the marshaled payload.
    pub(crate) async fn build_request(
        &self,
        method: &Method,
        url: &str,
        payload: &[u8],
        has_body: bool,
    ) -> Result<reqwest::RequestBuilder> {
        let mut builder = self
            .http
            .request(method.clone(), url)
            .timeout(self.http_timeout());
        builder = self.integration.set_request_headers(builder);
        builder = self.auth.authorize(builder).await?;
        if let Some(cookie) = &self.cookie_header {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
        if has_body {
            builder = builder.body(payload.to_vec());
        }
        Ok(builder)
    }

    /// Idempotent retry loop. Exits at or before the wall-clock deadline
    /// and after at most `max_retry_attempts + 1` attempts; the marshaled
    /// payload buffer is re-sent on every attempt.
    async fn execute_with_retries(
        &self,
        method: &Method,
        url: &str,
        payload: &[u8],
        has_body: bool,
        endpoint: &str,
        request_id: Uuid,
    ) -> Result<Response> {
        let deadline = Instant::now() + self.config.total_retry_duration;
        let mut attempt: u32 = 0;
        let mut deprecation_checked = false;

        loop {
            if attempt > self.config.max_retry_attempts || Instant::now() >= deadline {
                warn!(
                    request_id = %request_id,
                    attempts = attempt,
                    "retry budget exhausted"
                );
                return Err(ClientError::RetryExhausted { attempts: attempt });
            }

            let started = Instant::now();
            let builder = self.build_request(method, url, payload, has_body).await?;
            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) if err.is_redirect() => return Err(ClientError::RedirectLimit),
                Err(err) if err.is_timeout() || err.is_connect() => {
                    let wait = calculate_backoff(attempt);
                    warn!(
                        request_id = %request_id,
                        attempt = attempt,
                        error = %err,
                        wait_ms = wait.as_millis() as u64,
                        "transport error, will retry"
                    );
                    self.governor.record_retry();
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let elapsed = started.elapsed();
            let category = classify(response.status());
            self.governor.observe(category, elapsed);
            if !deprecation_checked {
                check_deprecation(response.headers(), endpoint);
                deprecation_checked = true;
            }

            let wait = match category {
                ResponseCategory::Success
                | ResponseCategory::Redirect
                | ResponseCategory::NotFound => {
                    debug!(
                        request_id = %request_id,
                        status = %response.status(),
                        attempt = attempt,
                        "request complete"
                    );
                    return Ok(response);
                }
                ResponseCategory::NonRetryable => {
                    return Err(self.integration.handle_error_response(response).await);
                }
                ResponseCategory::RateLimit => rate_limit_wait(response.headers())
                    .filter(|wait| !wait.is_zero())
                    .unwrap_or_else(|| calculate_backoff(attempt)),
                ResponseCategory::Transient => calculate_backoff(attempt),
            };

            warn!(
                request_id = %request_id,
                status = %response.status(),
                attempt = attempt,
                wait_ms = wait.as_millis() as u64,
                "retryable response, backing off"
            );
            drop(response);
            self.governor.record_retry();
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// Single-shot execution for non-idempotent methods: exactly one send,
    /// retryable categories surface as errors instead of looping.
    async fn execute_single(
        &self,
        method: &Method,
        url: &str,
        payload: &[u8],
        has_body: bool,
        endpoint: &str,
        request_id: Uuid,
    ) -> Result<Response> {
        let started = Instant::now();
        let builder = self.build_request(method, url, payload, has_body).await?;
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if err.is_redirect() => return Err(ClientError::RedirectLimit),
            Err(err) => return Err(err.into()),
        };

        let elapsed = started.elapsed();
        let category = classify(response.status());
        self.governor.observe(category, elapsed);
        check_deprecation(response.headers(), endpoint);

        match category {
            ResponseCategory::Success | ResponseCategory::Redirect | ResponseCategory::NotFound => {
                debug!(
                    request_id = %request_id,
                    status = %response.status(),
                    "request complete"
                );
                Ok(response)
            }
            ResponseCategory::NonRetryable => {
                Err(self.integration.handle_error_response(response).await)
            }
            ResponseCategory::RateLimit => Err(ClientError::RateLimited {
                retry_after: rate_limit_wait(response.headers()),
            }),
            ResponseCategory::Transient => Err(ClientError::Transient {
                status: response.status().as_u16(),
            }),
        }
    }
}
