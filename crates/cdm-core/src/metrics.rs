//! Session metrics: global and per-host counters that feed the sizer.
//!
//! All state sits behind one mutex with short critical sections; reads hand
//! out defensive copies so callers can never observe a torn update.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use crate::host::HostKey;
use crate::store::DownloadId;

/// Bounded window of recent download durations used for percentiles.
const LATENCY_WINDOW: usize = 1000;

/// Labels for the duration histogram, in bucket order.
pub const DURATION_BUCKET_LABELS: [&str; 5] = ["<5s", "<30s", "<2m", "<10m", ">=10m"];

const DURATION_BUCKET_BOUNDS_MS: [u64; 4] = [5_000, 30_000, 120_000, 600_000];

/// Per-host accumulators.
#[derive(Debug, Clone, Default)]
pub struct HostMetrics {
    pub started_count: u64,
    pub completed_count: u64,
    pub error_count: u64,
    pub total_bytes: u64,
    pub total_duration_ms: u64,
}

impl HostMetrics {
    /// Average observed throughput in bytes/second (0 with no data).
    pub fn avg_speed_bps(&self) -> u64 {
        if self.total_duration_ms == 0 {
            return 0;
        }
        ((self.total_bytes as f64) / (self.total_duration_ms as f64 / 1000.0)) as u64
    }

    /// `errors / (completed + errors)`, 0 with no data.
    pub fn error_rate(&self) -> f64 {
        let denom = self.completed_count + self.error_count;
        if denom == 0 {
            return 0.0;
        }
        self.error_count as f64 / denom as f64
    }
}

/// Copy of the global counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub total_started: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_transient_retries: u64,
    pub total_bytes_downloaded: u64,
    pub active_downloads_count: usize,
    /// Histogram of completed-download durations, `DURATION_BUCKET_LABELS` order.
    pub duration_buckets: [u64; 5],
    pub per_host: HashMap<HostKey, HostMetrics>,
}

/// p50/p95/p99 over the bounded duration window, milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationPercentiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

#[derive(Debug)]
struct ActiveDownload {
    host: HostKey,
    started: Instant,
}

#[derive(Default)]
struct Inner {
    total_started: u64,
    total_completed: u64,
    total_failed: u64,
    total_transient_retries: u64,
    total_bytes_downloaded: u64,
    duration_buckets: [u64; 5],
    per_host: HashMap<HostKey, HostMetrics>,
    active: HashMap<DownloadId, ActiveDownload>,
    durations_ms: VecDeque<u64>,
}

/// Session-wide metrics registry.
#[derive(Default)]
pub struct SessionMetrics {
    inner: Mutex<Inner>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A download entered the active set.
    pub fn record_started(&self, id: DownloadId, host: HostKey) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.total_started += 1;
        inner.per_host.entry(host.clone()).or_default().started_count += 1;
        inner.active.insert(
            id,
            ActiveDownload {
                host,
                started: Instant::now(),
            },
        );
    }

    /// A download finished; duration is measured from `record_started`.
    pub fn record_completed(&self, id: DownloadId, bytes: u64) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        let Some(active) = inner.active.remove(&id) else {
            return;
        };
        let duration_ms = active.started.elapsed().as_millis() as u64;

        inner.total_completed += 1;
        inner.total_bytes_downloaded += bytes;

        let bucket = DURATION_BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| duration_ms < bound)
            .unwrap_or(DURATION_BUCKET_BOUNDS_MS.len());
        inner.duration_buckets[bucket] += 1;

        if inner.durations_ms.len() == LATENCY_WINDOW {
            inner.durations_ms.pop_front();
        }
        inner.durations_ms.push_back(duration_ms);

        let host = inner.per_host.entry(active.host).or_default();
        host.completed_count += 1;
        host.total_bytes += bytes;
        host.total_duration_ms += duration_ms;
    }

    /// A download failed terminally.
    pub fn record_failed(&self, id: DownloadId) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.total_failed += 1;
        if let Some(active) = inner.active.remove(&id) {
            inner.per_host.entry(active.host).or_default().error_count += 1;
        }
    }

    /// A download left the active set without completing or failing
    /// (pause/cancel). Counters other than the active set are untouched.
    pub fn record_stopped(&self, id: DownloadId) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.active.remove(&id);
    }

    /// One transient error was retried somewhere.
    pub fn record_transient_retry(&self) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.total_transient_retries += 1;
    }

    /// Measured throughput for a host: `(avg_bps, completed_samples)`.
    /// This is what the adaptive sizer consumes.
    pub fn host_speed(&self, host: &HostKey) -> (u64, usize) {
        let inner = self.inner.lock().expect("metrics poisoned");
        match inner.per_host.get(host) {
            Some(h) => (h.avg_speed_bps(), h.completed_count as usize),
            None => (0, 0),
        }
    }

    /// Defensive copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics poisoned");
        MetricsSnapshot {
            total_started: inner.total_started,
            total_completed: inner.total_completed,
            total_failed: inner.total_failed,
            total_transient_retries: inner.total_transient_retries,
            total_bytes_downloaded: inner.total_bytes_downloaded,
            active_downloads_count: inner.active.len(),
            duration_buckets: inner.duration_buckets,
            per_host: inner.per_host.clone(),
        }
    }

    /// Percentiles over the bounded window. Each value is the sample at
    /// index `ceil(p * n) - 1` of the sorted window; zeros with no data.
    pub fn percentiles(&self) -> DurationPercentiles {
        let inner = self.inner.lock().expect("metrics poisoned");
        if inner.durations_ms.is_empty() {
            return DurationPercentiles::default();
        }
        let mut sorted: Vec<u64> = inner.durations_ms.iter().copied().collect();
        sorted.sort_unstable();
        let pick = |p: f64| {
            let n = sorted.len() as f64;
            let idx = ((p * n).ceil() as usize).saturating_sub(1);
            sorted[idx.min(sorted.len() - 1)]
        };
        DurationPercentiles {
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
        }
    }

    /// Clear all state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        *inner = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn host(s: &str) -> HostKey {
        HostKey::from_url(s).unwrap()
    }

    /// Test hook: complete a download with an explicit duration.
    fn complete_with_duration(m: &SessionMetrics, id: DownloadId, bytes: u64, ms: u64) {
        {
            let mut inner = m.inner.lock().unwrap();
            if let Some(active) = inner.active.get_mut(&id) {
                active.started = Instant::now() - Duration::from_millis(ms);
            }
        }
        m.record_completed(id, bytes);
    }

    #[test]
    fn counters_track_lifecycle() {
        let m = SessionMetrics::new();
        m.record_started(1, host("https://a.com/x"));
        m.record_started(2, host("https://a.com/y"));
        assert_eq!(m.snapshot().active_downloads_count, 2);

        m.record_completed(1, 1000);
        m.record_failed(2);

        let snap = m.snapshot();
        assert_eq!(snap.total_started, 2);
        assert_eq!(snap.total_completed, 1);
        assert_eq!(snap.total_failed, 1);
        assert_eq!(snap.total_bytes_downloaded, 1000);
        assert_eq!(snap.active_downloads_count, 0);

        let h = &snap.per_host[&host("https://a.com/z")];
        assert_eq!(h.started_count, 2);
        assert_eq!(h.completed_count, 1);
        assert_eq!(h.error_count, 1);
        assert_eq!(h.error_rate(), 0.5);
    }

    #[test]
    fn error_rate_zero_with_no_data() {
        assert_eq!(HostMetrics::default().error_rate(), 0.0);
    }

    #[test]
    fn host_speed_feeds_sizer() {
        let m = SessionMetrics::new();
        let h = host("https://cdn.example.com/f");
        m.record_started(1, h.clone());
        // 10 MB in 2 seconds -> 5 MB/s.
        complete_with_duration(&m, 1, 10_000_000, 2_000);

        let (bps, samples) = m.host_speed(&h);
        assert_eq!(samples, 1);
        assert!((4_900_000..=5_100_000).contains(&bps), "bps = {}", bps);

        // Unknown host has no data.
        assert_eq!(m.host_speed(&host("https://other.com/f")), (0, 0));
    }

    #[test]
    fn percentiles_follow_ceil_rule() {
        let m = SessionMetrics::new();
        for (id, ms) in [(1, 100u64), (2, 150), (3, 200)] {
            m.record_started(id, host("https://a.com/x"));
            complete_with_duration(&m, id, 10, ms);
        }
        let p = m.percentiles();
        assert_eq!(p.p50, 150);
        assert_eq!(p.p95, 200);
        assert_eq!(p.p99, 200);

        m.reset();
        assert_eq!(m.percentiles(), DurationPercentiles::default());
        assert_eq!(m.snapshot().total_completed, 0);
    }

    #[test]
    fn duration_buckets_partition_completions() {
        let m = SessionMetrics::new();
        let cases = [
            (1, 1_000u64, 0usize),   // <5s
            (2, 10_000, 1),          // <30s
            (3, 60_000, 2),          // <2m
            (4, 300_000, 3),         // <10m
            (5, 700_000, 4),         // >=10m
        ];
        for (id, ms, _) in cases {
            m.record_started(id, host("https://a.com/x"));
            complete_with_duration(&m, id, 1, ms);
        }
        let snap = m.snapshot();
        for (_, _, bucket) in cases {
            assert!(snap.duration_buckets[bucket] >= 1);
        }
        assert_eq!(snap.duration_buckets.iter().sum::<u64>(), 5);
    }

    #[test]
    fn retries_counted_globally() {
        let m = SessionMetrics::new();
        m.record_transient_retry();
        m.record_transient_retry();
        assert_eq!(m.snapshot().total_transient_retries, 2);
    }

    #[test]
    fn stopped_download_leaves_counters_alone() {
        let m = SessionMetrics::new();
        m.record_started(1, host("https://a.com/x"));
        m.record_stopped(1);
        let snap = m.snapshot();
        assert_eq!(snap.active_downloads_count, 0);
        assert_eq!(snap.total_completed, 0);
        assert_eq!(snap.total_failed, 0);
    }
}
