//! Response classification and rate-limit header parsing
//!
//! Maps an HTTP status to exactly one [`ResponseCategory`] and extracts the
//! server's wait hint when it is throttling us. Redirect following itself is
//! the transport's job; a surfaced 3xx is only reported here.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::warn;

const X_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const X_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
const DEPRECATION: &str = "deprecation";

/// Disjoint response categories driving the retry state machine.
///
/// Every status in 100..=599 maps to exactly one category; anything not
/// matched by a more specific rule is non-retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCategory {
    /// 2xx
    Success,
    /// 3xx, reported to the caller; follow-redirect policy is external
    Redirect,
    /// 404, surfaced to the caller as-is
    NotFound,
    /// 429, retryable with a server wait hint
    RateLimit,
    /// 408, 500, 502, 503, 504 - expected to be temporary
    Transient,
    /// Everything else - retrying will not help
    NonRetryable,
}

/// Classifies a status code into its category.
pub fn classify(status: StatusCode) -> ResponseCategory {
    if status.is_success() {
        return ResponseCategory::Success;
    }
    if status.is_redirection() {
        return ResponseCategory::Redirect;
    }
    match status {
        StatusCode::NOT_FOUND => ResponseCategory::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ResponseCategory::RateLimit,
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => ResponseCategory::Transient,
        _ => ResponseCategory::NonRetryable,
    }
}

/// Extracts the wait the server asked for on a 429 response.
///
/// `Retry-After` (delta seconds or an HTTP-date) wins over the
/// `X-RateLimit-Remaining`/`X-RateLimit-Reset` pair; the latter only
/// applies when the remaining quota is zero. Returns `None` when the
/// server gave no usable hint, in which case the caller falls back to
/// exponential backoff.
pub fn rate_limit_wait(headers: &HeaderMap) -> Option<Duration> {
    if let Some(value) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) {
        if let Ok(seconds) = value.trim().parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
        if let Ok(date) = DateTime::parse_from_rfc2822(value) {
            let delta = date.with_timezone(&Utc) - Utc::now();
            return Some(delta.to_std().unwrap_or(Duration::ZERO));
        }
        warn!(retry_after = value, "unparseable Retry-After header");
    }

    let remaining = headers
        .get(X_RATE_LIMIT_REMAINING)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())?;
    if remaining > 0 {
        return None;
    }
    let reset = headers
        .get(X_RATE_LIMIT_RESET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let delta = reset - Utc::now().timestamp();
    Some(Duration::from_secs(delta.max(0) as u64))
}

/// Logs a warning when the server flagged the endpoint as deprecated.
/// Classification is unaffected.
pub fn check_deprecation(headers: &HeaderMap, endpoint: &str) {
    if let Some(value) = headers.get(DEPRECATION).and_then(|v| v.to_str().ok()) {
        warn!(
            endpoint = endpoint,
            deprecation = value,
            "server marked endpoint as deprecated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_category_table() {
        assert_eq!(classify(StatusCode::OK), ResponseCategory::Success);
        assert_eq!(classify(StatusCode::CREATED), ResponseCategory::Success);
        assert_eq!(
            classify(StatusCode::MOVED_PERMANENTLY),
            ResponseCategory::Redirect
        );
        assert_eq!(classify(StatusCode::NOT_FOUND), ResponseCategory::NotFound);
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS),
            ResponseCategory::RateLimit
        );
        assert_eq!(
            classify(StatusCode::SERVICE_UNAVAILABLE),
            ResponseCategory::Transient
        );
        assert_eq!(
            classify(StatusCode::UNAUTHORIZED),
            ResponseCategory::NonRetryable
        );
        assert_eq!(
            classify(StatusCode::UNPROCESSABLE_ENTITY),
            ResponseCategory::NonRetryable
        );
    }

    #[test]
    fn test_exactly_one_category_for_every_status() {
        for code in 100..=599u16 {
            let Ok(status) = StatusCode::from_u16(code) else {
                continue;
            };
            // classify is a total function returning a single variant;
            // spot-check the partition boundaries explicitly.
            let category = classify(status);
            match code {
                200..=299 => assert_eq!(category, ResponseCategory::Success),
                300..=399 => assert_eq!(category, ResponseCategory::Redirect),
                404 => assert_eq!(category, ResponseCategory::NotFound),
                429 => assert_eq!(category, ResponseCategory::RateLimit),
                408 | 500 | 502 | 503 | 504 => {
                    assert_eq!(category, ResponseCategory::Transient)
                }
                _ => assert_eq!(category, ResponseCategory::NonRetryable),
            }
        }
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(rate_limit_wait(&headers), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_retry_after_http_date() {
        let future = Utc::now() + chrono::Duration::seconds(30);
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_str(&future.to_rfc2822()).unwrap(),
        );
        let wait = rate_limit_wait(&headers).unwrap();
        assert!(wait <= Duration::from_secs(30));
        assert!(wait >= Duration::from_secs(25));
    }

    #[test]
    fn test_retry_after_wins_over_rate_limit_pair() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
        headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from_static("0"));
        headers.insert(X_RATE_LIMIT_RESET, HeaderValue::from_static("0"));
        assert_eq!(rate_limit_wait(&headers), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_rate_limit_reset_pair() {
        let reset = Utc::now().timestamp() + 10;
        let mut headers = HeaderMap::new();
        headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from_static("0"));
        headers.insert(
            X_RATE_LIMIT_RESET,
            HeaderValue::from_str(&reset.to_string()).unwrap(),
        );
        let wait = rate_limit_wait(&headers).unwrap();
        assert!(wait <= Duration::from_secs(10));
    }

    #[test]
    fn test_remaining_quota_left_means_no_wait() {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from_static("3"));
        headers.insert(X_RATE_LIMIT_RESET, HeaderValue::from_static("99999999999"));
        assert_eq!(rate_limit_wait(&headers), None);
    }

    #[test]
    fn test_no_hint() {
        assert_eq!(rate_limit_wait(&HeaderMap::new()), None);
    }
}
