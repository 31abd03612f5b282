//! A single circuit breaker: CLOSED / OPEN / HALF_OPEN.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;
use crate::error::DownloadError;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Callback invoked with (scope, new_state) on every transition.
pub type BreakerObserver = Arc<dyn Fn(&str, BreakerState) + Send + Sync>;

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerStats {
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
}

/// Fail-fast gate around calls to one scope (a host, or everything).
///
/// CLOSED counts failures; at `failure_threshold` it opens for `timeout_ms`.
/// OPEN rejects every call until the deadline, then the next acquire moves to
/// HALF_OPEN. HALF_OPEN closes after `success_threshold` consecutive
/// successes and reopens on a single failure.
pub struct CircuitBreaker {
    scope: String,
    cfg: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
    observer: Option<BreakerObserver>,
}

impl CircuitBreaker {
    pub fn new(
        scope: String,
        cfg: CircuitBreakerConfig,
        observer: Option<BreakerObserver>,
    ) -> Self {
        Self {
            scope,
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                half_open_successes: 0,
                last_failure_at: None,
                next_attempt_at: None,
            }),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            observer,
        }
    }

    /// The scope string this breaker covers ("global" or a host).
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Current state; an expired OPEN reports (and becomes) HALF_OPEN.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Gate a call. `Err(BreakerOpen)` means fail fast without calling.
    pub fn try_acquire(&self) -> Result<(), DownloadError> {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        self.maybe_half_open(&mut inner);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                Err(DownloadError::BreakerOpen {
                    host: self.scope.clone(),
                })
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.cfg.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.failure_count = 0;
                    inner.half_open_successes = 0;
                    inner.last_failure_at = None;
                    inner.next_attempt_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("breaker poisoned");
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.cfg.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            // A single failure while probing re-opens.
            BreakerState::HalfOpen => self.trip(&mut inner),
            BreakerState::Open => {}
        }
    }

    /// Run `f` under the breaker. When OPEN, returns `fallback` if provided,
    /// otherwise the rejection error. Success/failure of `f` is recorded.
    pub async fn execute<T, F, Fut>(&self, f: F, fallback: Option<T>) -> Result<T, DownloadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        if let Err(rejected) = self.try_acquire() {
            return match fallback {
                Some(v) => Ok(v),
                None => Err(rejected),
            };
        }
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Forget stale CLOSED failures: if the last failure is older than
    /// `reset_timeout_ms`, the counter starts over. Keeps isolated old
    /// failures from accumulating toward the threshold forever.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        if inner.state != BreakerState::Closed || inner.failure_count == 0 {
            return;
        }
        let stale = inner
            .last_failure_at
            .map(|at| at.elapsed() > Duration::from_millis(self.cfg.reset_timeout_ms))
            .unwrap_or(false);
        if stale {
            inner.failure_count = 0;
            inner.last_failure_at = None;
            tracing::debug!(scope = %self.scope, "breaker failure counter reset");
        }
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    fn trip(&self, inner: &mut Inner) {
        self.transition(inner, BreakerState::Open);
        inner.next_attempt_at =
            Some(Instant::now() + Duration::from_millis(self.cfg.timeout_ms));
        inner.half_open_successes = 0;
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            let due = inner
                .next_attempt_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(true);
            if due {
                self.transition(inner, BreakerState::HalfOpen);
                inner.half_open_successes = 0;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        if inner.state == to {
            return;
        }
        tracing::info!(scope = %self.scope, from = inner.state.as_str(), to = to.as_str(), "breaker state change");
        inner.state = to;
        if let Some(observer) = &self.observer {
            observer(&self.scope, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            timeout_ms: 40,
            reset_timeout_ms: 100,
            per_host: false,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test".to_string(), cfg(), None)
    }

    #[test]
    fn opens_at_failure_threshold() {
        let b = breaker();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn open_becomes_half_open_after_timeout() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        assert!(b.try_acquire().is_err());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test]
    async fn execute_returns_fallback_when_open_and_counts_rejections() {
        let b = breaker();
        for _ in 0..2 {
            let _ = b
                .execute::<u32, _, _>(|| async { Err(DownloadError::Http(500)) }, None)
                .await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        let v = b.execute(|| async { Ok(1u32) }, Some(42u32)).await.unwrap();
        assert_eq!(v, 42, "open breaker must return the fallback");
        assert_eq!(b.stats().total_rejected, 1);

        // Without a fallback the rejection surfaces as an error.
        let err = b.execute::<u32, _, _>(|| async { Ok(1) }, None).await;
        assert!(matches!(err, Err(DownloadError::BreakerOpen { .. })));
        assert_eq!(b.stats().total_rejected, 2);
    }

    #[test]
    fn sweep_clears_stale_closed_failures() {
        let b = breaker();
        b.record_failure();
        std::thread::sleep(Duration::from_millis(120));
        b.sweep();
        // The old failure no longer counts toward the threshold.
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn observer_sees_transitions() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let observer: BreakerObserver = Arc::new(move |_scope, _state| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        let b = CircuitBreaker::new("obs".to_string(), cfg(), Some(observer));
        b.record_failure();
        b.record_failure(); // -> OPEN
        std::thread::sleep(Duration::from_millis(60));
        let _ = b.state(); // -> HALF_OPEN
        b.record_success();
        b.record_success(); // -> CLOSED
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
