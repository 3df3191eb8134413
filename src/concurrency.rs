//! Concurrency governor
//!
//! Admission control for outbound requests:
//! - Semaphore-gated concurrency limiting with per-request permit identities
//! - Acquisition latency tracking (overall and recent-window averages)
//! - Performance counters for requests, retries and rate-limit hits
//! - Adaptive capacity adjustment driven by acquisition latency drift

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::response::ResponseCategory;

/// Floor for adaptive capacity adjustment.
pub const MIN_CONCURRENCY: usize = 1;
/// Ceiling for adaptive capacity adjustment.
pub const MAX_CONCURRENCY: usize = 10;
/// Admission deadline applied when the caller brings none.
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10);

const ACQUISITION_HISTORY_CAP: usize = 100;
const HISTORICAL_WINDOW: usize = 5;
const EVALUATION_INTERVAL: Duration = Duration::from_secs(60);
const BURST_WINDOW: Duration = Duration::from_secs(120);

/// Write-once-per-event performance counters.
#[derive(Debug, Clone, Default)]
pub struct RequestMetrics {
    pub total_requests: u64,
    pub total_retries: u64,
    pub total_rate_limit_errors: u64,
    pub total_response_time: Duration,
    pub total_token_wait_time: Duration,
    pub total_acquisitions: u64,
}

struct GateState {
    gate: Arc<Semaphore>,
    capacity: usize,
    held: HashSet<Uuid>,
    history: VecDeque<Duration>,
    last_acquired_at: Option<Instant>,
}

/// Counting admission gate with adaptive capacity.
///
/// A request holds exactly one permit for its entire duration; permits are
/// identified by a v4 UUID so acquisition and release can be correlated in
/// logs. All bookkeeping sits behind one mutex; the gate itself relies on
/// the semaphore's own synchronization.
pub struct ConcurrencyGovernor {
    state: Mutex<GateState>,
    metrics: Mutex<RequestMetrics>,
}

impl ConcurrencyGovernor {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                gate: Arc::new(Semaphore::new(capacity)),
                capacity,
                held: HashSet::new(),
                history: VecDeque::with_capacity(ACQUISITION_HISTORY_CAP),
                last_acquired_at: None,
            }),
            metrics: Mutex::new(RequestMetrics::default()),
        }
    }

    /// Blocks until a permit is available or the deadline elapses.
    ///
    /// Falls back to [`DEFAULT_ACQUISITION_TIMEOUT`] when the caller has no
    /// deadline of its own. On success the acquisition duration lands in
    /// the bounded history and the wait-time counter, and a fresh permit id
    /// is returned for log correlation.
    pub async fn acquire(&self, deadline: Option<Duration>) -> Result<Uuid> {
        let budget = deadline.unwrap_or(DEFAULT_ACQUISITION_TIMEOUT);
        let started = Instant::now();

        loop {
            let gate = self.state.lock().gate.clone();
            let Some(remaining) = budget.checked_sub(started.elapsed()) else {
                return Err(ClientError::PermitTimeout(budget));
            };
            let acquire_result = timeout(remaining, gate.acquire()).await;
            match acquire_result {
                Ok(Ok(permit)) => {
                    // Ownership moves to the held set; release() credits the
                    // gate explicitly so resizes keep their accounting.
                    permit.forget();
                    break;
                }
                // Gate was swapped out by a resize; queue on the new one.
                Ok(Err(_)) => continue,
                Err(_) => return Err(ClientError::PermitTimeout(budget)),
            }
        }

        let waited = started.elapsed();
        let id = Uuid::new_v4();
        {
            let mut state = self.state.lock();
            state.held.insert(id);
            if state.history.len() == ACQUISITION_HISTORY_CAP {
                state.history.pop_front();
            }
            state.history.push_back(waited);
            state.last_acquired_at = Some(Instant::now());
        }
        {
            let mut metrics = self.metrics.lock();
            metrics.total_acquisitions += 1;
            metrics.total_token_wait_time += waited;
        }
        debug!(
            request_id = %id,
            waited_ms = waited.as_millis() as u64,
            "request permit acquired"
        );
        Ok(id)
    }

    /// Returns a permit. A second release of the same id is an error but
    /// leaves the counter untouched.
    pub fn release(&self, id: Uuid) {
        let mut state = self.state.lock();
        if !state.held.remove(&id) {
            error!(request_id = %id, "permit released twice, ignoring");
            return;
        }
        if state.gate.available_permits() + state.held.len() < state.capacity {
            state.gate.add_permits(1);
        }
        debug!(request_id = %id, "request permit released");
    }

    /// Mean acquisition wait over all observed acquisitions.
    pub fn average_acquisition_time(&self) -> Duration {
        let metrics = self.metrics.lock();
        if metrics.total_acquisitions == 0 {
            return Duration::ZERO;
        }
        metrics.total_token_wait_time / metrics.total_acquisitions as u32
    }

    /// Mean over the most recent acquisitions; falls back to the overall
    /// average while fewer than the window size are recorded.
    pub fn historical_average_acquisition_time(&self) -> Duration {
        let recent: Option<Duration> = {
            let state = self.state.lock();
            (state.history.len() >= HISTORICAL_WINDOW).then(|| {
                state
                    .history
                    .iter()
                    .rev()
                    .take(HISTORICAL_WINDOW)
                    .sum::<Duration>()
                    / HISTORICAL_WINDOW as u32
            })
        };
        recent.unwrap_or_else(|| self.average_acquisition_time())
    }

    /// Feeds a classified response outcome into the counters.
    pub fn observe(&self, category: ResponseCategory, response_time: Duration) {
        let mut metrics = self.metrics.lock();
        metrics.total_requests += 1;
        metrics.total_response_time += response_time;
        if category == ResponseCategory::RateLimit {
            metrics.total_rate_limit_errors += 1;
        }
    }

    /// Counts a scheduled retry attempt.
    pub fn record_retry(&self) {
        self.metrics.lock().total_retries += 1;
    }

    /// Snapshot of the performance counters.
    pub fn metrics(&self) -> RequestMetrics {
        self.metrics.lock().clone()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn available_permits(&self) -> usize {
        self.state.lock().gate.available_permits()
    }

    /// Resizes the gate atomically, preserving currently held permits.
    ///
    /// The replacement gate carries the unheld budget across: when growing
    /// it is topped up to what the held set leaves uncovered, when
    /// shrinking it is clamped to the new capacity. Waiters parked on the
    /// old gate are woken by closing it and re-queue on the new one, so
    /// permits are never leaked across a resize.
    pub fn adjust_limit(&self, new_capacity: usize) {
        let new_capacity = new_capacity.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        let mut state = self.state.lock();
        if new_capacity == state.capacity {
            return;
        }
        let available = state.gate.available_permits();
        let floor = new_capacity.saturating_sub(state.held.len());
        let carried = available.max(floor).min(new_capacity);
        let old = std::mem::replace(&mut state.gate, Arc::new(Semaphore::new(carried)));
        state.capacity = new_capacity;
        old.close();
        info!(
            capacity = new_capacity,
            carried_permits = carried,
            "concurrency limit adjusted"
        );
    }

    /// One adaptive evaluation tick.
    ///
    /// Only acts while the gate is bursting (a permit was acquired within
    /// the last two minutes); an idle gate is left alone. The overall
    /// acquisition average is compared against the recent-window average
    /// and the capacity nudged accordingly, clamped to
    /// `[MIN_CONCURRENCY, MAX_CONCURRENCY]`.
    pub fn evaluate(&self) {
        let bursting = {
            let state = self.state.lock();
            state
                .last_acquired_at
                .map(|at| at.elapsed() < BURST_WINDOW)
                .unwrap_or(false)
        };
        if !bursting {
            debug!("gate idle, skipping concurrency evaluation");
            return;
        }

        let average = self.average_acquisition_time();
        let historical = self.historical_average_acquisition_time();
        if historical.is_zero() {
            return;
        }
        let ratio = average.as_secs_f64() / historical.as_secs_f64();
        let current = self.capacity();
        let proposed = if ratio > 1.2 {
            current.saturating_sub(2)
        } else if ratio > 1.0 {
            current.saturating_sub(1)
        } else if ratio < 0.8 {
            current + 2
        } else if ratio < 1.0 {
            current + 1
        } else {
            current
        };
        let proposed = proposed.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);

        if proposed != current {
            info!(
                ratio = ratio,
                current = current,
                proposed = proposed,
                "acquisition latency drifted, adjusting concurrency limit"
            );
            self.adjust_limit(proposed);
        }
    }

    /// Spawns the periodic evaluator. The caller owns the handle and is
    /// expected to abort it when the client is dropped.
    pub fn spawn_evaluator(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + EVALUATION_INTERVAL, EVALUATION_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                governor.evaluate();
            }
        })
    }

    #[cfg(test)]
    fn seed(&self, overall: &[Duration], recent: &[Duration]) {
        let mut metrics = self.metrics.lock();
        metrics.total_acquisitions = overall.len() as u64;
        metrics.total_token_wait_time = overall.iter().sum();
        drop(metrics);
        let mut state = self.state.lock();
        state.history = recent.iter().copied().collect();
        state.last_acquired_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_acquire_release_roundtrip() {
        let governor = ConcurrencyGovernor::new(2);
        let a = governor.acquire(None).await.unwrap();
        let b = governor.acquire(None).await.unwrap();
        assert_eq!(governor.available_permits(), 0);
        governor.release(a);
        governor.release(b);
        assert_eq!(governor.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_gate_full() {
        let governor = ConcurrencyGovernor::new(1);
        let _held = governor.acquire(None).await.unwrap();
        let err = governor
            .acquire(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::PermitTimeout(_)));
    }

    #[tokio::test]
    async fn test_double_release_does_not_corrupt_counter() {
        let governor = ConcurrencyGovernor::new(2);
        let id = governor.acquire(None).await.unwrap();
        governor.release(id);
        governor.release(id);
        assert_eq!(governor.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_held_permits_never_exceed_capacity() {
        let capacity = 3;
        let governor = Arc::new(ConcurrencyGovernor::new(capacity));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let governor = governor.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let id = governor.acquire(None).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                governor.release(id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= capacity);
        assert_eq!(governor.available_permits(), capacity);
    }

    #[tokio::test]
    async fn test_resize_preserves_held_permits() {
        let governor = ConcurrencyGovernor::new(4);
        let a = governor.acquire(None).await.unwrap();
        let b = governor.acquire(None).await.unwrap();

        governor.adjust_limit(2);
        assert_eq!(governor.capacity(), 2);

        governor.release(a);
        governor.release(b);
        assert_eq!(governor.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_resize_up_restores_full_budget_after_releases() {
        let governor = ConcurrencyGovernor::new(2);
        let a = governor.acquire(None).await.unwrap();
        let b = governor.acquire(None).await.unwrap();

        governor.adjust_limit(5);
        governor.release(a);
        governor.release(b);
        assert_eq!(governor.available_permits(), 5);
    }

    #[tokio::test]
    async fn test_resize_wakes_waiters_onto_new_gate() {
        let governor = Arc::new(ConcurrencyGovernor::new(1));
        let held = governor.acquire(None).await.unwrap();

        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move { governor.acquire(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        governor.adjust_limit(2);
        let id = waiter.await.unwrap().unwrap();
        governor.release(id);
        governor.release(held);
    }

    #[tokio::test]
    async fn test_historical_average_falls_back_to_overall() {
        let governor = ConcurrencyGovernor::new(4);
        governor.seed(
            &[Duration::from_millis(100); 3],
            &[Duration::from_millis(100); 3],
        );
        assert_eq!(
            governor.historical_average_acquisition_time(),
            governor.average_acquisition_time()
        );
    }

    #[tokio::test]
    async fn test_evaluate_shrinks_on_slow_acquisitions() {
        let governor = ConcurrencyGovernor::new(10);
        // Overall average 125ms against a recent window at 100ms: ratio 1.25
        governor.seed(
            &[Duration::from_millis(125); 20],
            &[Duration::from_millis(100); HISTORICAL_WINDOW],
        );

        for expected in [8, 6, 4, 2, 1, 1] {
            governor.evaluate();
            assert_eq!(governor.capacity(), expected);
        }
    }

    #[tokio::test]
    async fn test_evaluate_grows_on_fast_acquisitions() {
        let governor = ConcurrencyGovernor::new(4);
        // Overall average 70ms against a recent window at 100ms: ratio 0.7
        governor.seed(
            &[Duration::from_millis(70); 20],
            &[Duration::from_millis(100); HISTORICAL_WINDOW],
        );

        governor.evaluate();
        assert_eq!(governor.capacity(), 6);
    }

    #[tokio::test]
    async fn test_evaluate_skips_idle_gate() {
        let governor = ConcurrencyGovernor::new(4);
        governor.evaluate();
        assert_eq!(governor.capacity(), 4);
    }

    #[tokio::test]
    async fn test_observe_counters() {
        let governor = ConcurrencyGovernor::new(2);
        governor.observe(ResponseCategory::Success, Duration::from_millis(10));
        governor.observe(ResponseCategory::RateLimit, Duration::from_millis(20));
        governor.record_retry();

        let metrics = governor.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.total_rate_limit_errors, 1);
        assert_eq!(metrics.total_retries, 1);
        assert_eq!(metrics.total_response_time, Duration::from_millis(30));
    }
}
