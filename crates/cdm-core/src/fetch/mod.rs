//! Fetch targets and the per-chunk fetcher.
//!
//! A `FetchTarget` is the capability the engine consumes: probe a URL for
//! size and range support, and stream one byte range into a sink. The real
//! implementation speaks HTTP through curl; tests use the in-memory stub.
//! Both are blocking and run on `spawn_blocking` from the engine.

mod chunk;
mod http;
mod stub;

pub use chunk::{chunk_dir, chunk_file_path, fetch_chunk, ChunkContext, ChunkProgress};
pub use http::HttpTarget;
pub use stub::StubTarget;

use std::io::Write;
use std::time::Duration;

use crate::error::DownloadError;
use crate::store::ByteRange;

/// Result of probing a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Size advertised by the server, if any.
    pub total_bytes: Option<u64>,
    /// True if the server honors `Range` requests.
    pub accepts_ranges: bool,
}

/// Parsed `Content-Range: bytes start-end/total` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` for an unknown total (`bytes 0-99/*`).
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parse the header value; returns None for malformed input.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range_part, total_part) = rest.split_once('/')?;
        let total = match total_part.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().ok()?),
        };
        let (start, end) = range_part.trim().split_once('-')?;
        Some(ContentRange {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
            total,
        })
    }
}

/// One range request against a target.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub url: String,
    /// Byte range to fetch; `None` means a plain GET (single-chunk plans
    /// against servers without range support).
    pub range: Option<ByteRange>,
    pub timeout: Duration,
}

/// What a completed transfer looked like on the wire.
#[derive(Debug, Clone, Copy)]
pub struct FetchSummary {
    pub status: u32,
    pub content_range: Option<ContentRange>,
    pub bytes_written: u64,
}

/// Callbacks observed during a transfer. `on_bytes` receives body deltas;
/// `is_cancelled` is polled so a pause/cancel intent tears the transfer down.
pub trait FetchObserver: Sync {
    fn on_bytes(&self, delta: u64);
    fn is_cancelled(&self) -> bool;
}

/// No-op observer for probes and tests.
pub struct NullObserver;

impl FetchObserver for NullObserver {
    fn on_bytes(&self, _delta: u64) {}
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A place bytes can be fetched from (network, test stub).
///
/// Both operations block; the engine wraps calls in `spawn_blocking`.
pub trait FetchTarget: Send + Sync + 'static {
    /// Establish total size and range support for a URL.
    fn probe(&self, url: &str, timeout: Duration) -> Result<ProbeResult, DownloadError>;

    /// Stream one range (or the whole body) into `sink`. Body bytes are only
    /// written for 200/206 responses; the summary carries the status and any
    /// `Content-Range` for validation by the caller.
    fn fetch_range(
        &self,
        request: &RangeRequest,
        sink: &mut dyn Write,
        observer: &dyn FetchObserver,
    ) -> Result<FetchSummary, DownloadError>;
}
