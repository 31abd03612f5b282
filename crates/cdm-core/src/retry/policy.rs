use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::ErrorClass;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff policy with cap and jitter.
///
/// Delay for attempt `n` (1-based) is `base * 2^(n-1)`, capped at `max_delay`,
/// then jittered by ±`jitter` (a fraction, e.g. 0.2 for ±20%).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay for backoff.
    pub base_delay: Duration,
    /// Upper bound on backoff delay (before jitter).
    pub max_delay: Duration,
    /// Jitter fraction in [0, 1).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Build from config: backoff shape from `retry`, attempt cap from
    /// `max_chunk_retries`.
    pub fn from_config(retry: &RetryConfig, max_chunk_retries: u32) -> Self {
        Self {
            max_attempts: max_chunk_retries.max(1),
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            jitter: retry.jitter.clamp(0.0, 0.99),
        }
    }

    /// Decide whether to retry after a failure on `attempt` (1-based).
    ///
    /// Only transient errors are retried; everything else fails fast.
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        if !class.is_transient() {
            return RetryDecision::NoRetry;
        }

        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RetryAfter(apply_jitter(raw, self.jitter))
    }
}

fn apply_jitter(d: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return d;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((d.as_secs_f64() * factor).max(0.0))
}
