//! Per-chunk fetch with retries, resume, and partial-integrity checks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::breaker::CircuitBreaker;
use crate::error::{DownloadError, ErrorClass};
use crate::fetch::{FetchObserver, FetchSummary, FetchTarget, RangeRequest};
use crate::metrics::SessionMetrics;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{ByteRange, Chunk, ChunkPatch, ChunkState, Download, DownloadId, Store};

/// Progress tick flowing from a chunk task to the engine's fold.
#[derive(Debug, Clone, Copy)]
pub struct ChunkProgress {
    pub download_id: DownloadId,
    pub chunk_index: i64,
    pub delta: u64,
}

/// Everything a chunk task needs, shared across the chunks of one download.
pub struct ChunkContext {
    pub store: Store,
    pub target: Arc<dyn FetchTarget>,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<SessionMetrics>,
    pub policy: RetryPolicy,
    pub timeout: Duration,
    /// Tolerance when matching on-disk chunk size during resume.
    pub size_margin: u64,
    /// False when the server ignores `Range`: the (single) chunk restarts
    /// from zero on every attempt and a 200 is the expected status.
    pub use_ranges: bool,
    pub cancel: Arc<AtomicBool>,
    pub progress: tokio::sync::mpsc::UnboundedSender<ChunkProgress>,
}

/// Directory holding the chunk files for a destination.
pub fn chunk_dir(save_path: &str) -> PathBuf {
    PathBuf::from(format!("{}.part", save_path))
}

/// Path of one chunk file (zero-padded decimal index).
pub fn chunk_file_path(save_path: &str, index: i64) -> PathBuf {
    chunk_dir(save_path).join(format!("{:04}", index))
}

/// Fetch one chunk to its file, resuming from bytes already on disk.
///
/// Transient failures retry with backoff up to the policy cap; every retry
/// bumps the breaker failure counter and every completion bumps its success
/// counter. Returns only after the chunk row reflects the outcome.
pub async fn fetch_chunk(
    ctx: &ChunkContext,
    download: &Download,
    chunk: &Chunk,
) -> Result<(), DownloadError> {
    let path = chunk_file_path(&download.save_path, chunk.chunk_index);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(DownloadError::Disk)?;
    }

    let expected = chunk.range().len();
    let mut attempt: u32 = 1;
    // Bytes already folded into the download's progress for this chunk.
    let mut accounted = chunk.downloaded_bytes;
    let streamed = Arc::new(std::sync::atomic::AtomicU64::new(0));

    loop {
        if ctx.cancel.load(Ordering::Relaxed) {
            return Err(DownloadError::Cancelled);
        }

        let on_disk = prepare_resume_point(&path, expected, ctx).await?;

        // Reconcile the fold with bytes found on disk (crash resume).
        if on_disk > accounted {
            send_progress(ctx, download.id, chunk.chunk_index, on_disk - accounted);
            accounted = on_disk;
        }

        if within_margin(on_disk, expected, ctx.size_margin) {
            return finish_chunk(ctx, download.id, chunk.chunk_index, expected).await;
        }

        if attempt == 1 {
            let _ = ctx
                .store
                .update_chunk_progress(
                    download.id,
                    chunk.chunk_index,
                    &ChunkPatch {
                        state: Some(ChunkState::Active),
                        downloaded_bytes: Some(on_disk),
                        ..Default::default()
                    },
                )
                .await;
        }

        let outcome =
            run_attempt(ctx, download, chunk, &path, on_disk, expected, &streamed).await;
        accounted += streamed.swap(0, Ordering::Relaxed);

        match outcome {
            Ok(()) => {
                return finish_chunk(ctx, download.id, chunk.chunk_index, expected).await;
            }
            Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
            Err(error) => {
                let class = error.class();
                record_failure(ctx, download.id, chunk, attempt, &error).await;

                if class == ErrorClass::NetworkTransient {
                    ctx.breaker.record_failure();
                    if let RetryDecision::RetryAfter(delay) = ctx.policy.decide(attempt, class) {
                        ctx.metrics.record_transient_retry();
                        tracing::debug!(
                            download_id = download.id,
                            chunk = chunk.chunk_index,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "chunk attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                }

                let _ = ctx
                    .store
                    .update_chunk_progress(
                        download.id,
                        chunk.chunk_index,
                        &ChunkPatch {
                            state: Some(ChunkState::Failed),
                            error: Some(Some(error.to_string())),
                            ..Default::default()
                        },
                    )
                    .await;
                return Err(error);
            }
        }
    }
}

/// One wire attempt: stream into the file, then validate what arrived.
async fn run_attempt(
    ctx: &ChunkContext,
    download: &Download,
    chunk: &Chunk,
    path: &Path,
    on_disk: u64,
    expected: u64,
    streamed: &Arc<std::sync::atomic::AtomicU64>,
) -> Result<(), DownloadError> {
    let range = if ctx.use_ranges {
        Some(ByteRange {
            start: chunk.start_byte + on_disk,
            end: chunk.end_byte,
        })
    } else {
        None
    };
    let request = RangeRequest {
        url: download.url.clone(),
        range,
        timeout: ctx.timeout,
    };

    let target = Arc::clone(&ctx.target);
    let observer = TickObserver::new(
        ctx.progress.clone(),
        Arc::clone(&ctx.cancel),
        download.id,
        chunk.chunk_index,
        Arc::clone(streamed),
    );
    let file_path = path.to_path_buf();

    let summary: FetchSummary = tokio::task::spawn_blocking(move || {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .map_err(DownloadError::Disk)?;
        let result = target.fetch_range(&request, &mut file, &observer);
        observer.flush();
        result
    })
    .await
    .map_err(|e| DownloadError::Internal(format!("chunk task join: {}", e)))??;

    validate_attempt(&summary, ctx.use_ranges, chunk, on_disk, download.total_bytes)?;

    let now_on_disk = file_len(path).await?;
    if now_on_disk != expected {
        return Err(DownloadError::PartialTransfer {
            expected,
            received: now_on_disk,
        });
    }
    Ok(())
}

/// Status and Content-Range checks for one completed transfer.
fn validate_attempt(
    summary: &FetchSummary,
    use_ranges: bool,
    chunk: &Chunk,
    resume_offset: u64,
    planned_total: u64,
) -> Result<(), DownloadError> {
    if use_ranges {
        if summary.status != 206 {
            return Err(DownloadError::Http(summary.status));
        }
        if let Some(cr) = summary.content_range {
            let wanted_start = chunk.start_byte + resume_offset;
            if cr.start != wanted_start || cr.end != chunk.end_byte {
                return Err(DownloadError::ContentRange(format!(
                    "server sent bytes {}-{}, requested {}-{}",
                    cr.start, cr.end, wanted_start, chunk.end_byte
                )));
            }
            if let Some(total) = cr.total {
                if planned_total != 0 && total != planned_total {
                    return Err(DownloadError::ContentRange(format!(
                        "total changed: planned {}, server reports {}",
                        planned_total, total
                    )));
                }
            }
        }
    } else if summary.status != 200 {
        return Err(DownloadError::Http(summary.status));
    }
    Ok(())
}

/// Measure the resume point, clearing files that cannot be resumed.
async fn prepare_resume_point(
    path: &Path,
    expected: u64,
    ctx: &ChunkContext,
) -> Result<u64, DownloadError> {
    let len = file_len(path).await?;
    // Over-long files are corrupt; rangeless transfers restart every time.
    let must_restart = len > expected || (!ctx.use_ranges && len > 0 && len < expected);
    if must_restart {
        tokio::fs::remove_file(path).await.map_err(DownloadError::Disk)?;
        return Ok(0);
    }
    Ok(len)
}

async fn file_len(path: &Path) -> Result<u64, DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(DownloadError::Disk(e)),
    }
}

fn within_margin(on_disk: u64, expected: u64, margin: u64) -> bool {
    on_disk == expected || (on_disk <= expected && expected - on_disk <= margin)
}

async fn finish_chunk(
    ctx: &ChunkContext,
    download_id: DownloadId,
    chunk_index: i64,
    expected: u64,
) -> Result<(), DownloadError> {
    ctx.breaker.record_success();
    ctx.store
        .update_chunk_progress(
            download_id,
            chunk_index,
            &ChunkPatch {
                downloaded_bytes: Some(expected),
                state: Some(ChunkState::Completed),
                error: Some(None),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| DownloadError::Internal(format!("persist chunk completion: {}", e)))?;
    Ok(())
}

async fn record_failure(
    ctx: &ChunkContext,
    download_id: DownloadId,
    chunk: &Chunk,
    attempt: u32,
    error: &DownloadError,
) {
    let message = format!(
        "chunk {} attempt {}: {} [{}]",
        chunk.chunk_index,
        attempt,
        error,
        error.class().as_str()
    );
    if let Err(e) = ctx.store.record_attempt(download_id, &message).await {
        tracing::warn!(download_id, "failed to record attempt: {:#}", e);
    }
    let _ = ctx
        .store
        .update_chunk_progress(
            download_id,
            chunk.chunk_index,
            &ChunkPatch {
                attempts: Some(chunk.attempts + attempt as i64),
                error: Some(Some(error.to_string())),
                ..Default::default()
            },
        )
        .await;
}

fn send_progress(ctx: &ChunkContext, download_id: DownloadId, chunk_index: i64, delta: u64) {
    if delta > 0 {
        let _ = ctx.progress.send(ChunkProgress {
            download_id,
            chunk_index,
            delta,
        });
    }
}

/// Observer that batches byte deltas into ticks: a tick goes out every
/// `TICK_BYTES` or `TICK_INTERVAL`, whichever comes first.
struct TickObserver {
    tx: tokio::sync::mpsc::UnboundedSender<ChunkProgress>,
    cancel: Arc<AtomicBool>,
    download_id: DownloadId,
    chunk_index: i64,
    /// Total bytes flushed as ticks this attempt; the retry loop folds this
    /// into its accounting so resumes never double-count.
    streamed: Arc<std::sync::atomic::AtomicU64>,
    pending: Mutex<TickState>,
}

struct TickState {
    bytes: u64,
    last_flush: Instant,
}

const TICK_BYTES: u64 = 256 * 1024;
const TICK_INTERVAL: Duration = Duration::from_millis(100);

impl TickObserver {
    fn new(
        tx: tokio::sync::mpsc::UnboundedSender<ChunkProgress>,
        cancel: Arc<AtomicBool>,
        download_id: DownloadId,
        chunk_index: i64,
        streamed: Arc<std::sync::atomic::AtomicU64>,
    ) -> Self {
        Self {
            tx,
            cancel,
            download_id,
            chunk_index,
            streamed,
            pending: Mutex::new(TickState {
                bytes: 0,
                last_flush: Instant::now(),
            }),
        }
    }

    fn flush(&self) {
        let mut state = self.pending.lock().expect("tick state poisoned");
        if state.bytes > 0 {
            self.streamed.fetch_add(state.bytes, Ordering::Relaxed);
            let _ = self.tx.send(ChunkProgress {
                download_id: self.download_id,
                chunk_index: self.chunk_index,
                delta: state.bytes,
            });
            state.bytes = 0;
        }
        state.last_flush = Instant::now();
    }
}

impl FetchObserver for TickObserver {
    fn on_bytes(&self, delta: u64) {
        let due = {
            let mut state = self.pending.lock().expect("tick state poisoned");
            state.bytes += delta;
            state.bytes >= TICK_BYTES || state.last_flush.elapsed() >= TICK_INTERVAL
        };
        if due {
            self.flush();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
