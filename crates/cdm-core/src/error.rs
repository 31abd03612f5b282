//! Download error taxonomy.
//!
//! Every failure in the fetch/assemble path is carried as a `DownloadError`
//! so the engine can classify it (retry, fail fast, breaker bump) without
//! string matching. Conversion to anyhow happens at the orchestration seam.

use thiserror::Error;

/// Broad classification used for retry and breaker decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection reset, timeout, 5xx, 429/408. Retried with backoff.
    NetworkTransient,
    /// 4xx (except 408/429), TLS, DNS. Fail fast.
    NetworkPermanent,
    /// Length or hash mismatch, bad Content-Range. Fail fast.
    Integrity,
    /// No space, permission denied. Fail fast, clean up staging.
    Disk,
    /// Illegal state transition rejected by the store.
    State,
    /// Circuit breaker rejected the call.
    BreakerOpen,
    /// Pause/cancel intent observed.
    Cancelled,
    /// Everything else (bugs, join errors).
    Internal,
}

impl ErrorClass {
    /// Stable lowercase name used in events and `error_message` fields.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NetworkTransient => "network-transient",
            ErrorClass::NetworkPermanent => "network-permanent",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Disk => "disk",
            ErrorClass::State => "state",
            ErrorClass::BreakerOpen => "breaker-open",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Internal => "internal",
        }
    }

    /// True if a retry with backoff may succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorClass::NetworkTransient)
    }
}

/// Error raised by a chunk fetch, probe, or assembly step.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Curl reported an error (timeout, connection, TLS, DNS).
    #[error("{0}")]
    Curl(#[from] curl::Error),

    /// HTTP response had an unexpected status.
    #[error("HTTP {0}")]
    Http(u32),

    /// Transfer finished but the byte count does not match the chunk.
    #[error("partial transfer: expected {expected} bytes, got {received}")]
    PartialTransfer { expected: u64, received: u64 },

    /// Content-Range bounds (or total) disagree with the planned chunk.
    #[error("content-range mismatch: {0}")]
    ContentRange(String),

    /// Disk write/rename failed (no space, permissions).
    #[error("disk: {0}")]
    Disk(#[source] std::io::Error),

    /// The store rejected a state transition.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// The circuit breaker for this host is open.
    #[error("circuit breaker open for {host}")]
    BreakerOpen { host: String },

    /// Pause or cancel was requested while the operation was in flight.
    #[error("cancelled")]
    Cancelled,

    /// Worker pool or join failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl DownloadError {
    /// Classify this error per the taxonomy above.
    pub fn class(&self) -> ErrorClass {
        match self {
            DownloadError::Curl(e) => classify_curl(e),
            DownloadError::Http(code) => classify_http(*code),
            DownloadError::PartialTransfer { .. } | DownloadError::ContentRange(_) => {
                ErrorClass::Integrity
            }
            DownloadError::Disk(_) => ErrorClass::Disk,
            DownloadError::IllegalTransition(_) => ErrorClass::State,
            DownloadError::BreakerOpen { .. } => ErrorClass::BreakerOpen,
            DownloadError::Cancelled => ErrorClass::Cancelled,
            DownloadError::Internal(_) => ErrorClass::Internal,
        }
    }
}

/// Classify an HTTP status code.
///
/// 5xx, 429, and 408 are worth retrying; the rest of 4xx means the request
/// itself is wrong and a retry cannot help.
pub fn classify_http(code: u32) -> ErrorClass {
    match code {
        408 | 429 => ErrorClass::NetworkTransient,
        500..=599 => ErrorClass::NetworkTransient,
        400..=499 => ErrorClass::NetworkPermanent,
        _ => ErrorClass::NetworkPermanent,
    }
}

/// Classify a curl error.
pub fn classify_curl(e: &curl::Error) -> ErrorClass {
    if e.is_operation_timedout() {
        return ErrorClass::NetworkTransient;
    }
    if e.is_couldnt_connect()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return ErrorClass::NetworkTransient;
    }
    if e.is_couldnt_resolve_host() || e.is_couldnt_resolve_proxy() || e.is_ssl_connect_error() {
        return ErrorClass::NetworkPermanent;
    }
    ErrorClass::NetworkPermanent
}
