//! One download, start to finish: gate, probe, plan, fetch, assemble.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::assemble::{self, AssembleParams};
use crate::error::{DownloadError, ErrorClass};
use crate::events::Event;
use crate::fetch::{fetch_chunk, ChunkContext, ProbeResult};
use crate::host::HostKey;
use crate::retry::RetryPolicy;
use crate::store::{ChunkState, Download, DownloadPatch, DownloadState};

use super::progress::ProgressFold;
use super::{plan, Engine};

/// How one run ended. Only `Completed` counts toward the queue total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Paused,
    Cancelled,
    NeedsConfirmation,
    /// The host breaker rejected the run; re-queue after its window.
    BreakerOpen,
    /// A transient probe failure; the row stays `queued` for a later pass.
    Requeued,
    /// Someone else moved the row (e.g. cancelled between pull and start).
    Skipped,
}

/// Drive one `queued` download to an outcome. Every path out of here leaves
/// the store consistent; errors never cross the executor boundary.
pub(super) async fn run_one(engine: &Arc<Engine>, download: Download) -> Result<RunOutcome> {
    let id = download.id;

    let host = match HostKey::from_url(&download.url) {
        Ok(host) => host,
        Err(e) => {
            return fail_from_queued(engine, &download, "network-permanent", &format!("{:#}", e))
                .await;
        }
    };

    // 1. Breaker gate.
    let breaker = engine.breakers.breaker_for(&host);
    if breaker.try_acquire().is_err() {
        tracing::info!(id, host = %host, "breaker open, download re-queued");
        return Ok(RunOutcome::BreakerOpen);
    }

    // 2. Probe for size and range support.
    let probe = match probe_url(engine, &download).await {
        Ok(probe) => {
            breaker.record_success();
            probe
        }
        Err(error) => {
            let class = error.class();
            let message = format!("probe: {} [{}]", error, class.as_str());
            if let Err(e) = engine.store().record_attempt(id, &message).await {
                tracing::warn!(id, "record probe attempt: {:#}", e);
            }
            if class.is_transient() {
                breaker.record_failure();
                engine.metrics.record_transient_retry();
                return Ok(RunOutcome::Requeued);
            }
            return fail_from_queued(engine, &download, class.as_str(), &message).await;
        }
    };

    let total_bytes = match probe.total_bytes.or(match download.total_bytes {
        0 => None,
        n => Some(n),
    }) {
        Some(n) if n > 0 => n,
        _ => {
            return fail_from_queued(
                engine,
                &download,
                "network-permanent",
                "server did not report a size and the catalog has none",
            )
            .await;
        }
    };

    // 3. Persist what the probe learned, then leave `queued`.
    engine
        .store()
        .update_download(
            id,
            &DownloadPatch {
                total_bytes: Some(total_bytes),
                ..Default::default()
            },
        )
        .await?;
    if !engine
        .store()
        .transition_state(id, DownloadState::Starting)
        .await?
    {
        return Ok(RunOutcome::Skipped);
    }
    engine.publish_state(id, DownloadState::Starting);

    // Reload: total and timestamps changed.
    let download = engine
        .store()
        .get_download(id)
        .await?
        .context("download vanished after starting")?;

    // 4. Park for confirmation when the destination looks problematic.
    if let Some(reason) = confirmation_reason(&download, total_bytes) {
        engine
            .store()
            .transition_state(id, DownloadState::NeedsConfirmation)
            .await?;
        engine.publish_state(id, DownloadState::NeedsConfirmation);
        engine.events.publish(Event::NeedsConfirmation {
            id,
            reason: reason.clone(),
        });
        tracing::info!(id, reason = %reason, "download needs confirmation");
        return Ok(RunOutcome::NeedsConfirmation);
    }

    // 5. Plan chunks (or reuse a resumable plan).
    let plan = plan::ensure_plan(
        engine.store(),
        &engine.cfg,
        &engine.metrics,
        &download,
        probe.accepts_ranges,
        &host,
    )
    .await?;

    tracing::debug!(
        id,
        chunks = plan.chunks.len(),
        reused = plan.reused,
        band = plan.band.unwrap_or("-"),
        ranges = plan.use_ranges,
        "chunk plan ready"
    );

    // 6. Go live.
    if !engine
        .store()
        .transition_state(id, DownloadState::Downloading)
        .await?
    {
        return Ok(RunOutcome::Skipped);
    }
    engine.publish_state(id, DownloadState::Downloading);
    engine.metrics.record_started(id, host.clone());
    let intent = engine.register_intent(id);

    // 7. Fetch all incomplete chunks, bounded per download and per host.
    let outcome = fetch_all_chunks(engine, &download, &plan, &host, &intent.stop).await;
    engine.unregister_intent(id);

    // 8. Tear down according to intent / errors / success.
    match outcome {
        ChunksOutcome::Stopped => {
            let target = *intent.target.lock().expect("intent poisoned");
            let moved = engine.store().transition_state(id, target).await?;
            if moved {
                engine.publish_state(id, target);
            }
            engine.metrics.record_stopped(id);
            tracing::info!(id, state = target.as_str(), "download stopped by request");
            Ok(match target {
                DownloadState::Cancelled => RunOutcome::Cancelled,
                _ => RunOutcome::Paused,
            })
        }
        ChunksOutcome::Failed(error) => {
            fail_from_downloading(engine, id, &error).await?;
            Ok(RunOutcome::Failed)
        }
        ChunksOutcome::AllCompleted => finish_download(engine, id, total_bytes).await,
    }
}

enum ChunksOutcome {
    AllCompleted,
    Failed(DownloadError),
    Stopped,
}

/// Dispatch chunk fetchers for every incomplete chunk and wait them out.
async fn fetch_all_chunks(
    engine: &Arc<Engine>,
    download: &Download,
    plan: &plan::Plan,
    host: &HostKey,
    stop: &Arc<std::sync::atomic::AtomicBool>,
) -> ChunksOutcome {
    let (tick_tx, tick_rx) = tokio::sync::mpsc::unbounded_channel();
    let fold = ProgressFold::new(
        engine.store().clone(),
        engine.events.clone(),
        download.id,
        download.total_bytes,
        download.downloaded_bytes,
        Duration::from_millis(engine.cfg.progress_batch_delay_ms),
        engine.cfg.progress_batch_bytes_threshold,
    );
    let fold_task = tokio::spawn(fold.run(tick_rx));

    let ctx = Arc::new(ChunkContext {
        store: engine.store().clone(),
        target: Arc::clone(&engine.target),
        breaker: engine.breakers.breaker_for(host),
        metrics: Arc::clone(&engine.metrics),
        policy: RetryPolicy::from_config(&engine.cfg.retry, engine.cfg.max_chunk_retries),
        timeout: Duration::from_millis(engine.cfg.chunk_operation_timeout_ms),
        size_margin: engine.cfg.size_margin_bytes,
        use_ranges: plan.use_ranges,
        cancel: Arc::clone(stop),
        progress: tick_tx,
    });

    let per_download = Arc::new(tokio::sync::Semaphore::new(
        engine.cfg.max_concurrent_chunks.max(1),
    ));
    let host_sem = engine.slots.host(host);

    let mut join_set: tokio::task::JoinSet<(i64, Result<(), DownloadError>)> =
        tokio::task::JoinSet::new();
    for chunk in plan
        .chunks
        .iter()
        .filter(|c| c.state != ChunkState::Completed)
        .cloned()
    {
        let ctx = Arc::clone(&ctx);
        let download = download.clone();
        let per_download = Arc::clone(&per_download);
        let host_sem = Arc::clone(&host_sem);
        join_set.spawn(async move {
            let index = chunk.chunk_index;
            let Ok(_chunk_permit) = per_download.acquire_owned().await else {
                return (index, Err(DownloadError::Cancelled));
            };
            let Ok(_host_permit) = host_sem.acquire_owned().await else {
                return (index, Err(DownloadError::Cancelled));
            };
            let result = fetch_chunk(&ctx, &download, &chunk).await;
            (index, result)
        });
    }
    drop(ctx); // the fold channel closes once every task finishes

    let mut first_error: Option<DownloadError> = None;
    let mut stopped = false;
    while let Some(joined) = join_set.join_next().await {
        let (index, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                first_error
                    .get_or_insert(DownloadError::Internal(format!("chunk task join: {}", e)));
                continue;
            }
        };
        match result {
            Ok(()) => {}
            Err(DownloadError::Cancelled) => stopped = true,
            Err(error) => {
                let chunk_row = engine
                    .store()
                    .get_chunks(download.id)
                    .await
                    .ok()
                    .and_then(|chunks| chunks.into_iter().find(|c| c.chunk_index == index));
                engine.events.publish(Event::ChunkFailed {
                    id: download.id,
                    chunk_index: index,
                    attempt: chunk_row.as_ref().map(|c| c.attempts).unwrap_or(0),
                    message: error.to_string(),
                });
                // One failed chunk dooms the run; stop fetching the rest.
                stop.store(true, Ordering::Relaxed);
                first_error.get_or_insert(error);
            }
        }
    }

    let folded = fold_task.await;
    if let Err(e) = folded {
        tracing::warn!(id = download.id, "progress fold join: {}", e);
    }

    if let Some(error) = first_error {
        return ChunksOutcome::Failed(error);
    }
    // A stop flag raised by an intent (not by a chunk failure).
    if stopped || stop.load(Ordering::Relaxed) {
        return ChunksOutcome::Stopped;
    }
    ChunksOutcome::AllCompleted
}

/// Hand the finished chunks to the assembler on the worker pool.
async fn finish_download(
    engine: &Arc<Engine>,
    id: i64,
    total_bytes: u64,
) -> Result<RunOutcome> {
    let download = engine
        .store()
        .get_download(id)
        .await?
        .context("download vanished before assembly")?;
    let chunk_count = engine.store().get_chunks(id).await?.len();

    let params = AssembleParams {
        save_path: download.save_path.clone(),
        chunk_count,
        expected_size: total_bytes,
        force_overwrite: download.force_overwrite,
    };
    let assembled = engine
        .pool
        .execute(move || assemble::assemble(&params).map_err(|e| e.to_string()))
        .await;

    match assembled {
        Ok(report) => {
            engine
                .store()
                .update_download(
                    id,
                    &DownloadPatch {
                        downloaded_bytes: Some(total_bytes),
                        progress: Some(1.0),
                        error_message: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
            engine
                .store()
                .transition_state(id, DownloadState::Completed)
                .await?;
            engine.publish_state(id, DownloadState::Completed);
            engine.events.publish(Event::DownloadCompleted {
                id,
                save_path: download.save_path.clone(),
                total_bytes,
                elapsed_ms: report.elapsed.as_millis() as u64,
            });
            engine.metrics.record_completed(id, total_bytes);
            tracing::info!(
                id,
                bytes = report.bytes_processed,
                chunks = report.chunks_deleted,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "download completed"
            );
            Ok(RunOutcome::Completed)
        }
        Err(pool_error) => {
            let error = DownloadError::Internal(pool_error.to_string());
            fail_from_downloading(engine, id, &error).await?;
            Ok(RunOutcome::Failed)
        }
    }
}

async fn probe_url(engine: &Arc<Engine>, download: &Download) -> Result<ProbeResult, DownloadError> {
    let target = Arc::clone(&engine.target);
    let url = download.url.clone();
    let timeout = Duration::from_millis(engine.cfg.chunk_operation_timeout_ms);
    tokio::task::spawn_blocking(move || target.probe(&url, timeout))
        .await
        .map_err(|e| DownloadError::Internal(format!("probe task join: {}", e)))?
}

/// Why a probed download should wait for the user before going live.
fn confirmation_reason(download: &Download, total_bytes: u64) -> Option<String> {
    let destination = Path::new(&download.save_path);
    if destination.exists() && !download.force_overwrite {
        return Some(format!("destination exists: {}", download.save_path));
    }
    if let Some(free) = free_disk_space(destination) {
        if free < total_bytes {
            return Some(format!(
                "insufficient disk space: {} bytes free, {} needed",
                free, total_bytes
            ));
        }
    }
    None
}

/// Free bytes on the filesystem holding `path` (best effort, unix only).
#[cfg(unix)]
fn free_disk_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty())?;
    let c_path = CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_disk_space(_path: &Path) -> Option<u64> {
    None
}

/// Terminal failure for a row still in `queued`: walk it through `starting`
/// so the machine's edges are honored, then fail it.
async fn fail_from_queued(
    engine: &Arc<Engine>,
    download: &Download,
    kind: &'static str,
    message: &str,
) -> Result<RunOutcome> {
    let id = download.id;
    if !engine
        .store()
        .transition_state(id, DownloadState::Starting)
        .await?
    {
        return Ok(RunOutcome::Skipped);
    }
    engine
        .store()
        .update_download(
            id,
            &DownloadPatch {
                error_message: Some(Some(message.to_string())),
                ..Default::default()
            },
        )
        .await?;
    engine
        .store()
        .transition_state(id, DownloadState::Failed)
        .await?;
    engine.publish_state(id, DownloadState::Failed);
    engine.events.publish(Event::DownloadFailed {
        id,
        kind,
        message: message.to_string(),
    });
    engine.events.publish(Event::ErrorNotification {
        id: Some(id),
        kind,
        message: message.to_string(),
    });
    engine.metrics.record_failed(id);
    tracing::warn!(id, kind, message, "download failed before starting");
    Ok(RunOutcome::Failed)
}

/// Terminal failure for a row in `downloading`.
async fn fail_from_downloading(
    engine: &Arc<Engine>,
    id: i64,
    error: &DownloadError,
) -> Result<()> {
    let class = error.class();
    let kind = match class {
        ErrorClass::NetworkTransient => "network-transient",
        other => other.as_str(),
    };
    let message = error.to_string();
    engine
        .store()
        .update_download(
            id,
            &DownloadPatch {
                error_message: Some(Some(message.clone())),
                ..Default::default()
            },
        )
        .await?;
    engine
        .store()
        .transition_state(id, DownloadState::Failed)
        .await?;
    engine.publish_state(id, DownloadState::Failed);
    engine.events.publish(Event::DownloadFailed {
        id,
        kind,
        message: message.clone(),
    });
    engine.events.publish(Event::ErrorNotification {
        id: Some(id),
        kind,
        message,
    });
    engine.metrics.record_failed(id);
    tracing::warn!(id, kind, error = %error, "download failed");
    Ok(())
}
