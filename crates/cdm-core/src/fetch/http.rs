//! Curl-backed fetch target.
//!
//! Probing prefers HEAD and falls back to a one-byte range GET for servers
//! that block HEAD. Range GETs stream through curl's transfer callbacks:
//! body bytes are only written for 200/206 responses, and the cancel flag
//! is polled on every write so a pause intent tears the transfer down.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::str;
use std::time::Duration;

use curl::easy::Easy;

use crate::error::DownloadError;

use super::{ContentRange, FetchObserver, FetchSummary, FetchTarget, ProbeResult, RangeRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches over HTTP(S) with libcurl.
#[derive(Debug, Default)]
pub struct HttpTarget;

impl HttpTarget {
    pub fn new() -> Self {
        HttpTarget
    }

    fn head_probe(&self, url: &str, timeout: Duration) -> Result<ProbeResult, DownloadError> {
        let mut headers: Vec<String> = Vec::new();

        let mut easy = Easy::new();
        easy.url(url)?;
        easy.nobody(true)?;
        easy.follow_location(true)?;
        easy.connect_timeout(CONNECT_TIMEOUT)?;
        easy.timeout(timeout)?;

        {
            let mut transfer = easy.transfer();
            transfer.header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    headers.push(s.trim_end().to_string());
                }
                true
            })?;
            transfer.perform()?;
        }

        let code = easy.response_code()?;
        if !(200..300).contains(&code) {
            return Err(DownloadError::Http(code));
        }

        let mut total_bytes = None;
        let mut accepts_ranges = false;
        for line in &headers {
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                let value = value.trim();
                if name.eq_ignore_ascii_case("content-length") {
                    if let Ok(n) = value.parse::<u64>() {
                        total_bytes = Some(n);
                    }
                }
                if name.eq_ignore_ascii_case("accept-ranges") {
                    accepts_ranges = value.eq_ignore_ascii_case("bytes");
                }
            }
        }
        Ok(ProbeResult {
            total_bytes,
            accepts_ranges,
        })
    }

    /// GET `bytes=0-0`: a 206 with `Content-Range` proves range support and
    /// reveals the total even when HEAD is blocked.
    fn range_probe(&self, url: &str, timeout: Duration) -> Result<ProbeResult, DownloadError> {
        let request = RangeRequest {
            url: url.to_string(),
            range: Some(crate::store::ByteRange { start: 0, end: 0 }),
            timeout,
        };
        let mut sink = std::io::sink();
        let summary = self.fetch_range(&request, &mut sink, &super::NullObserver)?;
        match summary.status {
            206 => Ok(ProbeResult {
                total_bytes: summary.content_range.and_then(|cr| cr.total),
                accepts_ranges: true,
            }),
            200 => Ok(ProbeResult {
                // The server streamed the whole body for a 1-byte range:
                // no range support; the byte count is the size.
                total_bytes: Some(summary.bytes_written),
                accepts_ranges: false,
            }),
            code => Err(DownloadError::Http(code)),
        }
    }
}

impl FetchTarget for HttpTarget {
    fn probe(&self, url: &str, timeout: Duration) -> Result<ProbeResult, DownloadError> {
        match self.head_probe(url, timeout) {
            Ok(result) if result.total_bytes.is_some() => Ok(result),
            Ok(_) | Err(DownloadError::Http(405)) | Err(DownloadError::Http(403)) => {
                tracing::debug!(url, "HEAD inconclusive, falling back to range probe");
                self.range_probe(url, timeout)
            }
            Err(e) => Err(e),
        }
    }

    fn fetch_range(
        &self,
        request: &RangeRequest,
        sink: &mut dyn Write,
        observer: &dyn FetchObserver,
    ) -> Result<FetchSummary, DownloadError> {
        // State shared between the header and write callbacks.
        let status = Cell::new(0u32);
        let content_range: RefCell<Option<ContentRange>> = RefCell::new(None);
        let bytes_written = Cell::new(0u64);
        let write_error: RefCell<Option<std::io::Error>> = RefCell::new(None);
        let cancelled = Cell::new(false);
        let sink = RefCell::new(sink);

        let mut easy = Easy::new();
        easy.url(&request.url)?;
        easy.get(true)?;
        easy.follow_location(true)?;
        easy.connect_timeout(CONNECT_TIMEOUT)?;
        easy.timeout(request.timeout)?;
        if let Some(range) = request.range {
            easy.range(&format!("{}-{}", range.start, range.end))?;
        }

        let perform_result = {
            let mut transfer = easy.transfer();
            transfer.header_function(|data| {
                let Ok(line) = str::from_utf8(data) else {
                    return true;
                };
                let line = line.trim();
                if line.starts_with("HTTP/") {
                    // New status line: a redirect restarts the header block.
                    if let Some(code) =
                        line.split_whitespace().nth(1).and_then(|s| s.parse().ok())
                    {
                        status.set(code);
                        *content_range.borrow_mut() = None;
                    }
                } else if let Some((name, value)) = line.split_once(':') {
                    if name.trim().eq_ignore_ascii_case("content-range") {
                        *content_range.borrow_mut() = ContentRange::parse(value);
                    }
                }
                true
            })?;
            transfer.write_function(|data| {
                if observer.is_cancelled() {
                    cancelled.set(true);
                    return Ok(0); // aborts the transfer
                }
                // Error bodies (5xx HTML pages etc.) must not land in the
                // chunk file.
                if !matches!(status.get(), 200 | 206) {
                    return Ok(data.len());
                }
                match sink.borrow_mut().write_all(data) {
                    Ok(()) => {
                        bytes_written.set(bytes_written.get() + data.len() as u64);
                        observer.on_bytes(data.len() as u64);
                        Ok(data.len())
                    }
                    Err(e) => {
                        *write_error.borrow_mut() = Some(e);
                        Ok(0)
                    }
                }
            })?;
            transfer.perform()
        };

        if let Err(e) = perform_result {
            if cancelled.get() {
                return Err(DownloadError::Cancelled);
            }
            if let Some(io) = write_error.into_inner() {
                return Err(DownloadError::Disk(io));
            }
            return Err(DownloadError::Curl(e));
        }

        Ok(FetchSummary {
            status: easy.response_code().unwrap_or_else(|_| status.get()),
            content_range: content_range.into_inner(),
            bytes_written: bytes_written.get(),
        })
    }
}
