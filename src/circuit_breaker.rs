//! Circuit breaker protection for the backend API
//!
//! Optional fail-fast guard in front of admission: consecutive server
//! failures open the circuit, requests are rejected without touching the
//! network until a cool-down passes, then a limited number of probes
//! decide whether to close it again.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failing - requests are rejected before admission
    Open,
    /// Cool-down elapsed - limited probe requests allowed
    HalfOpen,
}

// Probes needed to close from half-open, and the cap on concurrent probes.
const SUCCESS_THRESHOLD: u32 = 3;
const HALF_OPEN_MAX_PROBES: u32 = 3;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_probes: u32,
    opened_at: Option<Instant>,
    trips: u64,
}

/// Breaker guarding one client's backend.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<BreakerState>,
}

/// Point-in-time view of the breaker for diagnostics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trips: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            open_duration,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_probes: 0,
                opened_at: None,
                trips: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trips: inner.trips,
        }
    }

    /// Whether a request may proceed right now.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.open_duration)
                    .unwrap_or(true);
                if !cooled {
                    debug!("circuit open, rejecting request");
                    return false;
                }
                info!("circuit cool-down elapsed, probing backend");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.half_open_probes = 0;
                Self::try_probe(&mut inner)
            }
            CircuitState::HalfOpen => Self::try_probe(&mut inner),
        }
    }

    fn try_probe(inner: &mut BreakerState) -> bool {
        if inner.half_open_probes < HALF_OPEN_MAX_PROBES {
            inner.half_open_probes += 1;
            true
        } else {
            debug!("half-open probe budget spent, rejecting request");
            false
        }
    }

    /// Records a successful exchange with the backend.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= SUCCESS_THRESHOLD {
                    info!(
                        probes = inner.half_open_successes,
                        "backend recovered, closing circuit"
                    );
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {
                // A late success from before the trip; treat as recovery signal
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
            }
        }
    }

    /// Records a failed exchange with the backend.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        open_secs = self.open_duration.as_secs(),
                        "failure threshold reached, opening circuit"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.trips += 1;
                }
            }
            CircuitState::HalfOpen => {
                warn!("probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trips += 1;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(100));
        assert!(breaker.allow_request());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
        assert_eq!(breaker.stats().trips, 1);
    }

    #[test]
    fn test_recovery_through_half_open() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        breaker.record_failure();
        breaker.record_failure();

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().trips, 2);
    }

    #[test]
    fn test_probe_budget_is_bounded() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        let mut allowed = 0;
        for _ in 0..10 {
            if breaker.allow_request() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, HALF_OPEN_MAX_PROBES);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
