//! Store-level tests against an in-memory database.

use super::*;

fn spec(id: DownloadId) -> DownloadSpec {
    DownloadSpec {
        id,
        title: format!("file-{}.bin", id),
        url: format!("https://example.com/files/{}.bin", id),
        save_path: format!("/tmp/file-{}.bin", id),
        total_bytes: 0,
        priority: 0,
    }
}

async fn store_with(ids: &[DownloadId]) -> Store {
    let store = Store::open_memory().await.unwrap();
    for &id in ids {
        store.add_download(&spec(id), 100).await.unwrap();
    }
    store
}

#[tokio::test]
async fn add_download_is_idempotent() {
    let store = store_with(&[1]).await;
    let v1 = store.state_version().await.unwrap();

    let again = store.add_download(&spec(1), 100).await.unwrap();
    assert_eq!(again.id, 1);
    assert_eq!(again.state, DownloadState::Queued);

    // No duplicate row, no version bump.
    assert_eq!(store.list_downloads().await.unwrap().len(), 1);
    assert_eq!(store.state_version().await.unwrap(), v1);
}

#[tokio::test]
async fn add_download_fails_fast_when_queue_full() {
    let store = store_with(&[]).await;
    store.add_download(&spec(1), 2).await.unwrap();
    store.add_download(&spec(2), 2).await.unwrap();
    assert!(store.add_download(&spec(3), 2).await.is_err());

    // Terminal rows do not count against capacity.
    store.transition_state(1, DownloadState::Cancelled).await.unwrap();
    store.add_download(&spec(3), 2).await.unwrap();
}

#[tokio::test]
async fn legal_transition_chain_bumps_version_each_step() {
    let store = store_with(&[1]).await;
    let mut last = store.state_version().await.unwrap();

    for state in [
        DownloadState::Starting,
        DownloadState::Downloading,
        DownloadState::Completed,
    ] {
        assert!(store.transition_state(1, state).await.unwrap());
        let v = store.state_version().await.unwrap();
        assert!(v > last, "version must strictly increase");
        last = v;
    }

    let d = store.get_download(1).await.unwrap().unwrap();
    assert_eq!(d.state, DownloadState::Completed);
    assert!(d.completed_at.is_some());
    assert!(d.started_at.is_some());
}

#[tokio::test]
async fn illegal_transition_rejected_and_state_intact() {
    let store = store_with(&[1]).await;

    // queued -> completed is not an edge.
    assert!(!store.transition_state(1, DownloadState::Completed).await.unwrap());
    let d = store.get_download(1).await.unwrap().unwrap();
    assert_eq!(d.state, DownloadState::Queued);

    // Unknown id is a rejection, not an error.
    assert!(!store.transition_state(999, DownloadState::Starting).await.unwrap());
}

#[tokio::test]
async fn redownload_resets_counters_but_keeps_attempts_rows() {
    let store = store_with(&[1]).await;
    store.transition_state(1, DownloadState::Starting).await.unwrap();
    store.transition_state(1, DownloadState::Downloading).await.unwrap();
    store.record_attempt(1, "connection reset").await.unwrap();
    store
        .update_download(
            1,
            &DownloadPatch {
                downloaded_bytes: Some(500),
                progress: Some(1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store.transition_state(1, DownloadState::Completed).await.unwrap();

    assert!(store.transition_state(1, DownloadState::Queued).await.unwrap());
    let d = store.get_download(1).await.unwrap().unwrap();
    assert_eq!(d.state, DownloadState::Queued);
    assert_eq!(d.attempts_count, 0);
    assert_eq!(d.downloaded_bytes, 0);
    assert_eq!(d.progress, 0.0);
    assert!(d.error_message.is_none());

    // Attempt rows are history and survive the reset.
    assert_eq!(store.get_attempts(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_download_rejects_regressions() {
    let store = store_with(&[1]).await;
    store
        .update_download(
            1,
            &DownloadPatch {
                downloaded_bytes: Some(1000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let shrink = DownloadPatch {
        downloaded_bytes: Some(999),
        ..Default::default()
    };
    assert!(store.update_download(1, &shrink).await.is_err());

    let bad_progress = DownloadPatch {
        progress: Some(1.5),
        ..Default::default()
    };
    assert!(store.update_download(1, &bad_progress).await.is_err());

    let d = store.get_download(1).await.unwrap().unwrap();
    assert_eq!(d.downloaded_bytes, 1000);
}

#[tokio::test]
async fn snapshot_versioning_reports_changes() {
    let store = store_with(&[1]).await;
    let snap = store.get_snapshot(None).await.unwrap();
    assert!(snap.has_changes);
    assert_eq!(snap.downloads.len(), 1);

    let seen = snap.state_version;
    let unchanged = store.get_snapshot(Some(seen)).await.unwrap();
    assert!(!unchanged.has_changes);

    store.transition_state(1, DownloadState::Starting).await.unwrap();
    let changed = store.get_snapshot(Some(seen)).await.unwrap();
    assert!(changed.has_changes);
    assert!(changed.state_version > seen);
}

#[tokio::test]
async fn clear_downloads_removes_terminal_only() {
    let store = store_with(&[1, 2]).await;
    store.transition_state(2, DownloadState::Starting).await.unwrap();
    store.transition_state(2, DownloadState::Downloading).await.unwrap();
    store.transition_state(2, DownloadState::Completed).await.unwrap();

    let removed = store.clear_downloads().await.unwrap();
    assert_eq!(removed, 1);

    let remaining = store.list_downloads().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, 1);
    assert_eq!(remaining[0].state, DownloadState::Queued);
}

#[tokio::test]
async fn chunks_partition_validated_and_replaced() {
    let store = store_with(&[1]).await;
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

    // Parent must be starting/downloading.
    let ranges = [
        ByteRange { start: 0, end: 49 },
        ByteRange { start: 50, end: 99 },
    ];
    assert!(store.create_chunks(1, &ranges).await.is_err());

    store.transition_state(1, DownloadState::Starting).await.unwrap();
    store.create_chunks(1, &ranges).await.unwrap();

    let chunks = store.get_chunks(1).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].chunk_index, 0);
    assert_eq!(chunks[0].start_byte, 0);
    assert_eq!(chunks[1].end_byte, 99);
    assert!(chunks.iter().all(|c| c.state == ChunkState::Pending));

    // Replanning replaces the rows.
    let one = [ByteRange { start: 0, end: 99 }];
    store.create_chunks(1, &one).await.unwrap();
    assert_eq!(store.get_chunks(1).await.unwrap().len(), 1);

    // A bad partition is rejected atomically; the old plan survives.
    let gap = [
        ByteRange { start: 0, end: 10 },
        ByteRange { start: 12, end: 99 },
    ];
    assert!(store.create_chunks(1, &gap).await.is_err());
    assert_eq!(store.get_chunks(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn chunk_progress_is_monotonic() {
    let store = store_with(&[1]).await;
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
    store.transition_state(1, DownloadState::Starting).await.unwrap();
    store
        .create_chunks(1, &[ByteRange { start: 0, end: 99 }])
        .await
        .unwrap();

    store
        .update_chunk_progress(
            1,
            0,
            &ChunkPatch {
                downloaded_bytes: Some(40),
                state: Some(ChunkState::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // A stale, lower value does not move the counter back.
    store
        .update_chunk_progress(
            1,
            0,
            &ChunkPatch {
                downloaded_bytes: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let chunks = store.get_chunks(1).await.unwrap();
    assert_eq!(chunks[0].downloaded_bytes, 40);
    assert_eq!(chunks[0].state, ChunkState::Active);
}

#[tokio::test]
async fn terminal_state_drops_chunks() {
    let store = store_with(&[1]).await;
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
    store.transition_state(1, DownloadState::Starting).await.unwrap();
    store
        .create_chunks(1, &[ByteRange { start: 0, end: 99 }])
        .await
        .unwrap();
    store.transition_state(1, DownloadState::Cancelled).await.unwrap();
    assert!(store.get_chunks(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn reconcile_demotes_interrupted_rows() {
    let store = store_with(&[1, 2, 3]).await;
    store.transition_state(1, DownloadState::Starting).await.unwrap();
    store.transition_state(2, DownloadState::Starting).await.unwrap();
    store.transition_state(2, DownloadState::Downloading).await.unwrap();

    let demoted = store.reconcile_on_startup().await.unwrap();
    assert_eq!(demoted, 2);

    for id in [1, 2, 3] {
        let d = store.get_download(id).await.unwrap().unwrap();
        assert_eq!(d.state, DownloadState::Queued, "download {}", id);
    }
}

#[tokio::test]
async fn attempts_strictly_increase_and_history_records_edges() {
    let store = store_with(&[1]).await;
    let a1 = store.record_attempt(1, "timeout").await.unwrap();
    let a2 = store.record_attempt(1, "reset").await.unwrap();
    assert_eq!(a1.attempt_number, 1);
    assert_eq!(a2.attempt_number, 2);

    let d = store.get_download(1).await.unwrap().unwrap();
    assert_eq!(d.attempts_count, 2);

    store.transition_state(1, DownloadState::Starting).await.unwrap();
    store.transition_state(1, DownloadState::Failed).await.unwrap();
    let history = store.get_history(1).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].from_state, DownloadState::Queued);
    assert_eq!(history[0].to_state, DownloadState::Starting);
    assert_eq!(history[1].to_state, DownloadState::Failed);
}

#[tokio::test]
async fn delete_download_cascades() {
    let store = store_with(&[1]).await;
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
    store.transition_state(1, DownloadState::Starting).await.unwrap();
    store
        .create_chunks(1, &[ByteRange { start: 0, end: 99 }])
        .await
        .unwrap();
    store.record_attempt(1, "x").await.unwrap();

    assert!(store.delete_download(1).await.unwrap());
    assert!(store.get_download(1).await.unwrap().is_none());
    assert!(store.get_chunks(1).await.unwrap().is_empty());
    assert!(store.get_attempts(1).await.unwrap().is_empty());
    assert!(!store.delete_download(1).await.unwrap());
}

#[tokio::test]
async fn ready_queue_orders_by_priority_then_age() {
    let store = Store::open_memory().await.unwrap();
    let mut low = spec(1);
    low.priority = 0;
    let mut high = spec(2);
    high.priority = 5;
    let mut also_high = spec(3);
    also_high.priority = 5;

    store.add_download(&low, 100).await.unwrap();
    store.add_download(&high, 100).await.unwrap();
    store.add_download(&also_high, 100).await.unwrap();

    // Highest priority first; ties broken by insertion age (id 2 before 3).
    let next = store.next_queued().await.unwrap().unwrap();
    assert_eq!(next.id, 2);

    store.transition_state(2, DownloadState::Starting).await.unwrap();
    let next = store.next_queued().await.unwrap().unwrap();
    assert_eq!(next.id, 3);
}
