//! Events published at the system boundary.
//!
//! The engine broadcasts these; the UI/IPC layer subscribes and forwards.
//! Names and payload fields are part of the external contract, so variants
//! serialize to the exact kebab-case tags consumers match on.

use serde::Serialize;

use crate::store::{DownloadId, DownloadState};

/// One boundary event. Serialized form is `{"event": ..., fields...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    DownloadStateChanged {
        id: DownloadId,
        state: DownloadState,
    },
    DownloadProgress {
        id: DownloadId,
        downloaded_bytes: u64,
        total_bytes: u64,
        progress: f64,
    },
    DownloadCompleted {
        id: DownloadId,
        save_path: String,
        total_bytes: u64,
        elapsed_ms: u64,
    },
    DownloadFailed {
        id: DownloadId,
        kind: &'static str,
        message: String,
    },
    ChunkFailed {
        id: DownloadId,
        chunk_index: i64,
        attempt: i64,
        message: String,
    },
    NeedsConfirmation {
        id: DownloadId,
        reason: String,
    },
    FolderAddProgress {
        added: usize,
        total: usize,
    },
    FolderAddComplete {
        added: usize,
        failed: usize,
    },
    DownloadsRestored {
        count: u64,
    },
    HistoryCleaned {
        removed: u64,
    },
    ErrorNotification {
        id: Option<DownloadId>,
        kind: &'static str,
        message: String,
    },
}

impl Event {
    /// The external name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::DownloadStateChanged { .. } => "download-state-changed",
            Event::DownloadProgress { .. } => "download-progress",
            Event::DownloadCompleted { .. } => "download-completed",
            Event::DownloadFailed { .. } => "download-failed",
            Event::ChunkFailed { .. } => "chunk-failed",
            Event::NeedsConfirmation { .. } => "needs-confirmation",
            Event::FolderAddProgress { .. } => "folder-add-progress",
            Event::FolderAddComplete { .. } => "folder-add-complete",
            Event::DownloadsRestored { .. } => "downloads-restored",
            Event::HistoryCleaned { .. } => "history-cleaned",
            Event::ErrorNotification { .. } => "error-notification",
        }
    }
}

/// Broadcast fan-out to boundary subscribers. Slow subscribers lag and drop
/// (tokio broadcast semantics) rather than backpressure the engine.
#[derive(Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish; silently drops when nobody subscribes.
    pub fn publish(&self, event: Event) {
        tracing::trace!(event = event.name(), "publish");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
