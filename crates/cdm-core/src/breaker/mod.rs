//! Failure gating for the engine and for individual hosts.
//!
//! A breaker trips after repeated failures and rejects calls until a cooldown
//! elapses, then probes with a half-open window. The manager owns either one
//! global breaker (default) or a lazily-built per-host map, per config.

mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::CircuitBreakerConfig;
use crate::host::HostKey;

pub use state::{BreakerObserver, BreakerState, BreakerStats, CircuitBreaker};

/// Hands out breakers: one global, or one per `(scheme, host, port)`.
pub struct BreakerManager {
    cfg: CircuitBreakerConfig,
    global: Arc<CircuitBreaker>,
    per_host: Mutex<HashMap<HostKey, Arc<CircuitBreaker>>>,
    observer: Option<BreakerObserver>,
}

impl BreakerManager {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self::with_observer(cfg, None)
    }

    /// `observer` is invoked on every breaker state change with the breaker's
    /// scope ("global" or the host string) and its new state.
    pub fn with_observer(cfg: CircuitBreakerConfig, observer: Option<BreakerObserver>) -> Self {
        let global = Arc::new(CircuitBreaker::new(
            "global".to_string(),
            cfg.clone(),
            observer.clone(),
        ));
        Self {
            cfg,
            global,
            per_host: Mutex::new(HashMap::new()),
            observer,
        }
    }

    /// Breaker covering `host`. With `per_host` off this is always the
    /// global breaker.
    pub fn breaker_for(&self, host: &HostKey) -> Arc<CircuitBreaker> {
        if !self.cfg.per_host {
            return Arc::clone(&self.global);
        }
        let mut map = self.per_host.lock().expect("breaker map poisoned");
        Arc::clone(map.entry(host.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                host.to_string(),
                self.cfg.clone(),
                self.observer.clone(),
            ))
        }))
    }

    /// The global breaker, regardless of mode.
    pub fn global(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.global)
    }

    /// Forget stale CLOSED failures on every breaker. Run this at
    /// `sweep_interval`.
    pub fn sweep(&self) {
        self.global.sweep();
        let map = self.per_host.lock().expect("breaker map poisoned");
        for breaker in map.values() {
            breaker.sweep();
        }
    }

    /// Sweep cadence: `min(reset_timeout / 2, 30 s)`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cfg.reset_timeout_ms / 2).min(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(per_host: bool) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout_ms: 50,
            reset_timeout_ms: 200,
            per_host,
        }
    }

    #[test]
    fn global_mode_shares_one_breaker() {
        let mgr = BreakerManager::new(cfg(false));
        let a = mgr.breaker_for(&HostKey::from_url("https://a.com/x").unwrap());
        let b = mgr.breaker_for(&HostKey::from_url("https://b.com/y").unwrap());
        a.record_failure();
        a.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn per_host_mode_isolates_hosts() {
        let mgr = BreakerManager::new(cfg(true));
        let a = mgr.breaker_for(&HostKey::from_url("https://a.com/x").unwrap());
        let b = mgr.breaker_for(&HostKey::from_url("https://b.com/y").unwrap());
        a.record_failure();
        a.record_failure();
        assert_eq!(a.state(), BreakerState::Open);
        assert_eq!(b.state(), BreakerState::Closed);

        // Same host maps to the same breaker.
        let a2 = mgr.breaker_for(&HostKey::from_url("https://a.com/other").unwrap());
        assert_eq!(a2.state(), BreakerState::Open);
    }

    #[test]
    fn sweep_interval_capped_at_thirty_seconds() {
        let mut c = cfg(false);
        c.reset_timeout_ms = 10_000;
        assert_eq!(
            BreakerManager::new(c.clone()).sweep_interval(),
            Duration::from_secs(5)
        );
        c.reset_timeout_ms = 600_000;
        assert_eq!(
            BreakerManager::new(c).sweep_interval(),
            Duration::from_secs(30)
        );
    }
}
