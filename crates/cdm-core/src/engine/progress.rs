//! Progress folding: chunk deltas in, coalesced events and DB patches out.

use std::time::{Duration, Instant};

use crate::events::{Event, EventBus};
use crate::fetch::ChunkProgress;
use crate::store::{DownloadId, DownloadPatch, Store};

/// Folds chunk byte deltas into the download's monotonic counter and
/// publishes `download-progress` coalesced by byte threshold and delay.
/// Persists the counter on the same cadence so a crash loses little.
pub(super) struct ProgressFold {
    store: Store,
    events: EventBus,
    id: DownloadId,
    total_bytes: u64,
    downloaded: u64,
    published: u64,
    last_publish: Instant,
    delay: Duration,
    threshold: u64,
}

impl ProgressFold {
    pub(super) fn new(
        store: Store,
        events: EventBus,
        id: DownloadId,
        total_bytes: u64,
        already_downloaded: u64,
        delay: Duration,
        threshold: u64,
    ) -> Self {
        Self {
            store,
            events,
            id,
            total_bytes,
            downloaded: already_downloaded,
            published: already_downloaded,
            last_publish: Instant::now(),
            delay,
            threshold,
        }
    }

    /// Drain the tick channel until every sender is gone, then flush.
    pub(super) async fn run(
        mut self,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<ChunkProgress>,
    ) -> u64 {
        while let Some(tick) = rx.recv().await {
            self.apply(tick.delta).await;
        }
        self.flush().await;
        self.downloaded
    }

    async fn apply(&mut self, delta: u64) {
        // The fold never decreases and never exceeds the planned size.
        self.downloaded = (self.downloaded + delta).min(self.total_bytes);
        let due_bytes = self.downloaded - self.published >= self.threshold;
        let due_time = self.last_publish.elapsed() >= self.delay;
        if due_bytes || due_time {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.downloaded == self.published {
            return;
        }
        let progress = if self.total_bytes == 0 {
            0.0
        } else {
            self.downloaded as f64 / self.total_bytes as f64
        };
        let patch = DownloadPatch {
            downloaded_bytes: Some(self.downloaded),
            progress: Some(progress.clamp(0.0, 1.0)),
            ..Default::default()
        };
        if let Err(e) = self.store.update_download(self.id, &patch).await {
            tracing::warn!(id = self.id, "progress persist failed: {:#}", e);
        }
        self.events.publish(Event::DownloadProgress {
            id: self.id,
            downloaded_bytes: self.downloaded,
            total_bytes: self.total_bytes,
            progress: progress.clamp(0.0, 1.0),
        });
        self.published = self.downloaded;
        self.last_publish = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DownloadSpec, DownloadState};

    #[tokio::test]
    async fn fold_accumulates_and_persists() {
        let store = Store::open_memory().await.unwrap();
        store
            .add_download(
                &DownloadSpec {
                    id: 1,
                    title: "t".into(),
                    url: "https://example.com/f".into(),
                    save_path: "/tmp/f".into(),
                    total_bytes: 0,
                    priority: 0,
                },
                10,
            )
            .await
            .unwrap();
        store
            .update_download(
                1,
                &DownloadPatch {
                    total_bytes: Some(1000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.transition_state(1, DownloadState::Starting).await.unwrap();

        let events = EventBus::default();
        let mut event_rx = events.subscribe();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let fold = ProgressFold::new(
            store.clone(),
            events,
            1,
            1000,
            0,
            Duration::from_millis(0), // publish every tick
            1,
        );
        let task = tokio::spawn(fold.run(rx));

        for _ in 0..4 {
            tx.send(ChunkProgress {
                download_id: 1,
                chunk_index: 0,
                delta: 250,
            })
            .unwrap();
        }
        drop(tx);
        let final_bytes = task.await.unwrap();
        assert_eq!(final_bytes, 1000);

        let d = store.get_download(1).await.unwrap().unwrap();
        assert_eq!(d.downloaded_bytes, 1000);
        assert!((d.progress - 1.0).abs() < f64::EPSILON);

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.name(), "download-progress");
    }

    #[tokio::test]
    async fn fold_clamps_at_total() {
        let store = Store::open_memory().await.unwrap();
        store
            .add_download(
                &DownloadSpec {
                    id: 1,
                    title: "t".into(),
                    url: "https://example.com/f".into(),
                    save_path: "/tmp/f".into(),
                    total_bytes: 0,
                    priority: 0,
                },
                10,
            )
            .await
            .unwrap();
        store
            .update_download(
                1,
                &DownloadPatch {
                    total_bytes: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let fold = ProgressFold::new(
            store.clone(),
            EventBus::default(),
            1,
            100,
            0,
            Duration::from_millis(0),
            1,
        );
        let task = tokio::spawn(fold.run(rx));
        // Overshoot: duplicated resume accounting must not push past total.
        tx.send(ChunkProgress {
            download_id: 1,
            chunk_index: 0,
            delta: 80,
        })
        .unwrap();
        tx.send(ChunkProgress {
            download_id: 1,
            chunk_index: 0,
            delta: 80,
        })
        .unwrap();
        drop(tx);
        assert_eq!(task.await.unwrap(), 100);

        let d = store.get_download(1).await.unwrap().unwrap();
        assert_eq!(d.downloaded_bytes, 100);
        assert!(d.progress <= 1.0);
    }
}
