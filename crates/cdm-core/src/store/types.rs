//! Types stored in and returned by the download queue database.

use serde::{Deserialize, Serialize};

/// Download identifier (catalog-assigned, not auto-increment).
pub type DownloadId = i64;

/// Lifecycle state of a download, stored as a string in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    Starting,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
    NeedsConfirmation,
}

impl DownloadState {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Starting => "starting",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
            DownloadState::NeedsConfirmation => "needs_confirmation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => DownloadState::Queued,
            "starting" => DownloadState::Starting,
            "downloading" => DownloadState::Downloading,
            "paused" => DownloadState::Paused,
            "completed" => DownloadState::Completed,
            "failed" => DownloadState::Failed,
            "cancelled" => DownloadState::Cancelled,
            "needs_confirmation" => DownloadState::NeedsConfirmation,
            _ => return None,
        })
    }

    /// Terminal states are swept by `clear_downloads` / `clean_history`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

/// State of a single chunk row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl ChunkState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Active => "active",
            ChunkState::Completed => "completed",
            ChunkState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ChunkState::Pending,
            "active" => ChunkState::Active,
            "completed" => ChunkState::Completed,
            "failed" => ChunkState::Failed,
            _ => return None,
        })
    }
}

/// What a client supplies when enqueueing a download.
#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub id: DownloadId,
    pub title: String,
    pub url: String,
    pub save_path: String,
    /// Expected size from the catalog; 0 until probed.
    pub total_bytes: u64,
    pub priority: i32,
}

/// Full download row.
#[derive(Debug, Clone, Serialize)]
pub struct Download {
    pub id: DownloadId,
    pub title: String,
    pub url: String,
    pub save_path: String,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Fraction complete in [0, 1].
    pub progress: f64,
    pub state: DownloadState,
    pub priority: i32,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    pub error_message: Option<String>,
    pub attempts_count: i64,
    /// Set when the user confirmed overwriting an existing destination.
    pub force_overwrite: bool,
}

/// Partial update applied by `update_download`.
///
/// `downloaded_bytes` may only grow; `progress` must stay inside [0, 1].
#[derive(Debug, Clone, Default)]
pub struct DownloadPatch {
    pub progress: Option<f64>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub error_message: Option<Option<String>>,
}

/// An inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered (inclusive bounds).
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// HTTP Range header value: `bytes=start-end`.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Chunk row: one byte range of its parent download.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub download_id: DownloadId,
    pub chunk_index: i64,
    pub start_byte: u64,
    pub end_byte: u64,
    pub downloaded_bytes: u64,
    pub state: ChunkState,
    pub attempts: i64,
    pub error: Option<String>,
}

impl Chunk {
    pub fn range(&self) -> ByteRange {
        ByteRange {
            start: self.start_byte,
            end: self.end_byte,
        }
    }
}

/// Partial update applied by `update_chunk_progress`.
#[derive(Debug, Clone, Default)]
pub struct ChunkPatch {
    pub downloaded_bytes: Option<u64>,
    pub state: Option<ChunkState>,
    pub attempts: Option<i64>,
    pub error: Option<Option<String>>,
}

/// Append-only record of one failed attempt.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub download_id: DownloadId,
    pub attempt_number: i64,
    pub error: String,
    pub at: i64,
}

/// One state transition, kept for `get_history`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub download_id: DownloadId,
    pub from_state: DownloadState,
    pub to_state: DownloadState,
    pub at: i64,
}

/// Versioned view over the downloads table.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Monotonic counter bumped on every persistent mutation.
    pub state_version: i64,
    /// True iff `state_version` exceeds the caller's `min_version`.
    pub has_changes: bool,
    pub downloads: Vec<Download>,
}
