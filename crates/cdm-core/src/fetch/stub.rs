//! In-memory fetch target for tests.
//!
//! Serves a fixed body with configurable range support and scripted
//! failures, so engine and fetcher tests run without a network or a server
//! thread.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::DownloadError;
use crate::store::ByteRange;

use super::{ContentRange, FetchObserver, FetchSummary, FetchTarget, ProbeResult, RangeRequest};

const WRITE_SLICE: usize = 16 * 1024;

/// Scripted behavior for one upcoming `fetch_range` call.
enum Script {
    /// Fail outright with this error.
    Fail(DownloadError),
    /// Serve only the first `n` bytes of the requested range, then claim
    /// success (exercises the partial-integrity check).
    Truncate(u64),
}

/// A fake server holding one body in memory.
pub struct StubTarget {
    body: Vec<u8>,
    accepts_ranges: bool,
    scripts: Mutex<VecDeque<Script>>,
    probe_scripts: Mutex<VecDeque<DownloadError>>,
    /// When set, Content-Range reports this total instead of the real one
    /// (simulates a file that changed on the server between probe and fetch).
    total_override: Mutex<Option<u64>>,
    /// Sleep between write slices, to make transfers observably slow.
    slice_delay: Mutex<Duration>,
    probe_calls: AtomicU64,
    fetch_calls: AtomicU64,
}

impl StubTarget {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            accepts_ranges: true,
            scripts: Mutex::new(VecDeque::new()),
            probe_scripts: Mutex::new(VecDeque::new()),
            total_override: Mutex::new(None),
            slice_delay: Mutex::new(Duration::ZERO),
            probe_calls: AtomicU64::new(0),
            fetch_calls: AtomicU64::new(0),
        }
    }

    /// A server that ignores `Range` and always streams the full body.
    pub fn without_ranges(body: Vec<u8>) -> Self {
        Self {
            accepts_ranges: false,
            ..Self::new(body)
        }
    }

    /// Queue a failure for the next fetch call. Calls consume scripts FIFO.
    pub fn fail_next(&self, error: DownloadError) {
        self.scripts
            .lock()
            .expect("stub poisoned")
            .push_back(Script::Fail(error));
    }

    /// Queue a truncated response (serves `n` bytes of the range).
    pub fn truncate_next(&self, n: u64) {
        self.scripts
            .lock()
            .expect("stub poisoned")
            .push_back(Script::Truncate(n));
    }

    /// Queue a failure for the next probe call.
    pub fn fail_next_probe(&self, error: DownloadError) {
        self.probe_scripts
            .lock()
            .expect("stub poisoned")
            .push_back(error);
    }

    /// Slow transfers down: sleep this long between write slices.
    pub fn set_slice_delay(&self, delay: Duration) {
        *self.slice_delay.lock().expect("stub poisoned") = delay;
    }

    /// Lie about the total in `Content-Range` from now on.
    pub fn override_total(&self, total: u64) {
        *self.total_override.lock().expect("stub poisoned") = Some(total);
    }

    pub fn probe_calls(&self) -> u64 {
        self.probe_calls.load(Ordering::Relaxed)
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    fn reported_total(&self) -> u64 {
        self.total_override
            .lock()
            .expect("stub poisoned")
            .unwrap_or(self.body.len() as u64)
    }

    fn stream(
        &self,
        slice: &[u8],
        limit: Option<u64>,
        sink: &mut dyn Write,
        observer: &dyn FetchObserver,
    ) -> Result<u64, DownloadError> {
        let mut written = 0u64;
        let delay = *self.slice_delay.lock().expect("stub poisoned");
        let cap = limit.unwrap_or(slice.len() as u64).min(slice.len() as u64);
        for piece in slice[..cap as usize].chunks(WRITE_SLICE) {
            if observer.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            sink.write_all(piece).map_err(DownloadError::Disk)?;
            written += piece.len() as u64;
            observer.on_bytes(piece.len() as u64);
        }
        Ok(written)
    }
}

impl FetchTarget for StubTarget {
    fn probe(&self, _url: &str, _timeout: Duration) -> Result<ProbeResult, DownloadError> {
        self.probe_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = self.probe_scripts.lock().expect("stub poisoned").pop_front() {
            return Err(error);
        }
        Ok(ProbeResult {
            total_bytes: Some(self.body.len() as u64),
            accepts_ranges: self.accepts_ranges,
        })
    }

    fn fetch_range(
        &self,
        request: &RangeRequest,
        sink: &mut dyn Write,
        observer: &dyn FetchObserver,
    ) -> Result<FetchSummary, DownloadError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);

        let script = self.scripts.lock().expect("stub poisoned").pop_front();
        let limit = match script {
            Some(Script::Fail(error)) => return Err(error),
            Some(Script::Truncate(n)) => Some(n),
            None => None,
        };

        match request.range {
            Some(ByteRange { start, end }) if self.accepts_ranges => {
                let total = self.body.len() as u64;
                if start >= total {
                    return Ok(FetchSummary {
                        status: 416,
                        content_range: None,
                        bytes_written: 0,
                    });
                }
                let end = end.min(total - 1);
                let slice = &self.body[start as usize..=end as usize];
                let bytes_written = self.stream(slice, limit, sink, observer)?;
                Ok(FetchSummary {
                    status: 206,
                    content_range: Some(ContentRange {
                        start,
                        end,
                        total: Some(self.reported_total()),
                    }),
                    bytes_written,
                })
            }
            // Range ignored or never asked for: full body, plain 200.
            _ => {
                let bytes_written = self.stream(&self.body, limit, sink, observer)?;
                Ok(FetchSummary {
                    status: 200,
                    content_range: None,
                    bytes_written,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::NullObserver;

    fn body(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn serves_ranges_with_content_range() {
        let stub = StubTarget::new(body(1000));
        let mut out = Vec::new();
        let summary = stub
            .fetch_range(
                &RangeRequest {
                    url: "stub://file".to_string(),
                    range: Some(ByteRange { start: 100, end: 199 }),
                    timeout: Duration::from_secs(1),
                },
                &mut out,
                &NullObserver,
            )
            .unwrap();
        assert_eq!(summary.status, 206);
        assert_eq!(summary.bytes_written, 100);
        assert_eq!(out, body(1000)[100..200].to_vec());
        let cr = summary.content_range.unwrap();
        assert_eq!((cr.start, cr.end, cr.total), (100, 199, Some(1000)));
    }

    #[test]
    fn no_range_support_returns_200_full_body() {
        let stub = StubTarget::without_ranges(body(100));
        let mut out = Vec::new();
        let summary = stub
            .fetch_range(
                &RangeRequest {
                    url: "stub://file".to_string(),
                    range: Some(ByteRange { start: 0, end: 49 }),
                    timeout: Duration::from_secs(1),
                },
                &mut out,
                &NullObserver,
            )
            .unwrap();
        assert_eq!(summary.status, 200);
        assert_eq!(summary.bytes_written, 100);
    }

    #[test]
    fn scripted_failures_consume_fifo() {
        let stub = StubTarget::new(body(10));
        stub.fail_next(DownloadError::Http(503));
        let mut out = Vec::new();
        let req = RangeRequest {
            url: "stub://file".to_string(),
            range: Some(ByteRange { start: 0, end: 9 }),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            stub.fetch_range(&req, &mut out, &NullObserver),
            Err(DownloadError::Http(503))
        ));
        // Next call succeeds.
        assert!(stub.fetch_range(&req, &mut out, &NullObserver).is_ok());
        assert_eq!(stub.fetch_calls(), 2);
    }

    #[test]
    fn out_of_bounds_range_is_416() {
        let stub = StubTarget::new(body(10));
        let mut out = Vec::new();
        let summary = stub
            .fetch_range(
                &RangeRequest {
                    url: "stub://file".to_string(),
                    range: Some(ByteRange { start: 50, end: 60 }),
                    timeout: Duration::from_secs(1),
                },
                &mut out,
                &NullObserver,
            )
            .unwrap();
        assert_eq!(summary.status, 416);
    }
}
