//! Chunk planning: reuse an existing plan on resume, otherwise lay out a
//! new one (adaptive when the host has history, static bands otherwise).

use anyhow::{Context, Result};

use crate::config::CdmConfig;
use crate::host::HostKey;
use crate::metrics::SessionMetrics;
use crate::sizer;
use crate::store::{ByteRange, Chunk, Download, Store};

/// The plan a download will run with.
pub(super) struct Plan {
    pub chunks: Vec<Chunk>,
    /// False when the server ignores `Range`: single chunk, plain GET.
    pub use_ranges: bool,
    /// True when existing chunk rows were kept (resume path).
    pub reused: bool,
    /// Band label when the adaptive path decided, for logging.
    pub band: Option<&'static str>,
}

/// Idempotent planning: existing rows whose partition still matches
/// `total_bytes` are reused; anything else is replaced.
pub(super) async fn ensure_plan(
    store: &Store,
    cfg: &CdmConfig,
    metrics: &SessionMetrics,
    download: &Download,
    accepts_ranges: bool,
    host: &HostKey,
) -> Result<Plan> {
    let total = download.total_bytes;
    let existing = store.get_chunks(download.id).await?;

    if !existing.is_empty() && plan_still_valid(&existing, total, accepts_ranges) {
        tracing::debug!(id = download.id, chunks = existing.len(), "reusing chunk plan");
        return Ok(Plan {
            chunks: existing,
            use_ranges: accepts_ranges,
            reused: true,
            band: None,
        });
    }

    let (ranges, band): (Vec<ByteRange>, Option<&'static str>) = if !accepts_ranges {
        (vec![ByteRange { start: 0, end: total - 1 }], None)
    } else {
        let (speed_bps, samples) = metrics.host_speed(host);
        match sizer::plan_adaptive(&cfg.adaptive_chunks, total, speed_bps, samples) {
            Some(layout) => {
                tracing::info!(
                    id = download.id,
                    band = layout.band_label,
                    speed_bps = layout.measured_speed_bps,
                    chunks = layout.ranges.len(),
                    chunk_size = layout.chunk_size_used,
                    "adaptive chunk layout"
                );
                (layout.ranges, Some(layout.band_label))
            }
            None => (
                sizer::plan_static(total, cfg.adaptive_chunks.max_chunks),
                None,
            ),
        }
    };

    store
        .create_chunks(download.id, &ranges)
        .await
        .with_context(|| format!("persist chunk plan for download {}", download.id))?;
    let chunks = store.get_chunks(download.id).await?;
    Ok(Plan {
        chunks,
        use_ranges: accepts_ranges,
        reused: false,
        band,
    })
}

/// A stored plan is reusable when it still partitions `[0, total - 1]` and
/// matches the transport (no ranges means a single chunk).
fn plan_still_valid(chunks: &[Chunk], total: u64, accepts_ranges: bool) -> bool {
    if total == 0 {
        return false;
    }
    if !accepts_ranges && chunks.len() != 1 {
        return false;
    }
    if chunks[0].start_byte != 0 || chunks[chunks.len() - 1].end_byte != total - 1 {
        return false;
    }
    chunks
        .windows(2)
        .all(|pair| pair[1].start_byte == pair[0].end_byte + 1)
}
