//! Exponential backoff with jitter for retries

use std::time::Duration;

/// Base delay for the first retry.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the exponential component of the delay.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Computes the wait before retry number `retry_count`.
///
/// The delay doubles with every retry, capped at [`MAX_DELAY`], with a
/// uniform random jitter in `[0, BASE_DELAY)` added on top so that
/// concurrent clients do not retry in lockstep. `retry_count = 0` yields
/// at least [`BASE_DELAY`]; the result never exceeds
/// `MAX_DELAY + BASE_DELAY`.
pub fn calculate_backoff(retry_count: u32) -> Duration {
    // 2^26s already exceeds MAX_DELAY, clamp the exponent before shifting
    let exponent = retry_count.min(26);
    let exponential = BASE_DELAY
        .checked_mul(1 << exponent)
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY);

    let jitter = Duration::from_secs_f64(BASE_DELAY.as_secs_f64() * rand::random::<f64>());
    exponential + jitter
}
