//! Chunk layout planning.
//!
//! The adaptive path maps measured host throughput onto a speed band, picks
//! that band's target chunk size, and splits the file into an exact
//! partition. With too little history (or the feature off) it abstains and
//! the engine falls back to the static file-size bands.

use crate::config::AdaptiveChunksConfig;
use crate::store::ByteRange;

/// One speed band: downloads measured at or below `max_speed_bps` get
/// `target_chunk_size` chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedBand {
    pub max_speed_bps: u64,
    pub target_chunk_size: u64,
    pub label: &'static str,
}

/// Default bands. Slow hosts get small chunks so a dropped connection loses
/// little; fast hosts get large chunks so per-request overhead amortizes.
pub const SPEED_BANDS: [SpeedBand; 5] = [
    SpeedBand {
        max_speed_bps: 512 * 1024,
        target_chunk_size: 4 * 1024 * 1024,
        label: "very slow",
    },
    SpeedBand {
        max_speed_bps: 2 * 1024 * 1024,
        target_chunk_size: 8 * 1024 * 1024,
        label: "slow",
    },
    SpeedBand {
        max_speed_bps: 10 * 1024 * 1024,
        target_chunk_size: 16 * 1024 * 1024,
        label: "medium",
    },
    SpeedBand {
        max_speed_bps: 50 * 1024 * 1024,
        target_chunk_size: 32 * 1024 * 1024,
        label: "fast",
    },
    SpeedBand {
        max_speed_bps: u64::MAX,
        target_chunk_size: 64 * 1024 * 1024,
        label: "very fast",
    },
];

/// First band whose upper bound covers `speed_bps` (boundary inclusive).
pub fn select_speed_band(speed_bps: u64) -> SpeedBand {
    for band in SPEED_BANDS {
        if speed_bps <= band.max_speed_bps {
            return band;
        }
    }
    SPEED_BANDS[SPEED_BANDS.len() - 1]
}

/// An adaptive layout decision.
#[derive(Debug, Clone)]
pub struct ChunkLayout {
    pub ranges: Vec<ByteRange>,
    /// Actual per-chunk size after clamping (last chunk may be shorter).
    pub chunk_size_used: u64,
    pub band_label: &'static str,
    pub measured_speed_bps: u64,
}

/// Splits `[0, total_bytes - 1]` into chunks of `chunk_size`; the last chunk
/// absorbs the remainder. Returns an empty vec for a zero-byte file.
pub fn build_ranges(total_bytes: u64, chunk_size: u64) -> Vec<ByteRange> {
    if total_bytes == 0 || chunk_size == 0 {
        return Vec::new();
    }
    let count = total_bytes.div_ceil(chunk_size);
    let mut out = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for _ in 0..count {
        let end = (start + chunk_size - 1).min(total_bytes - 1);
        out.push(ByteRange { start, end });
        start = end + 1;
    }
    out
}

/// Adaptive layout for a file, or `None` when the sizer abstains.
///
/// Abstains iff disabled, `speed_bps == 0`, or `completed_samples`
/// is below `min_samples`.
pub fn plan_adaptive(
    cfg: &AdaptiveChunksConfig,
    total_bytes: u64,
    speed_bps: u64,
    completed_samples: usize,
) -> Option<ChunkLayout> {
    if !cfg.enabled || speed_bps == 0 || completed_samples < cfg.min_samples {
        return None;
    }
    if total_bytes == 0 {
        return None;
    }

    let band = select_speed_band(speed_bps);
    let target = band
        .target_chunk_size
        .clamp(cfg.min_chunk_size.max(1), cfg.max_chunk_size.max(1));

    let wanted = total_bytes.div_ceil(target);
    let num_chunks = wanted
        .clamp(cfg.min_chunks.max(1) as u64, cfg.max_chunks.max(1) as u64)
        .min(total_bytes);

    let chunk_size = total_bytes.div_ceil(num_chunks);
    let ranges = build_ranges(total_bytes, chunk_size);

    Some(ChunkLayout {
        ranges,
        chunk_size_used: chunk_size,
        band_label: band.label,
        measured_speed_bps: speed_bps,
    })
}

/// Static fallback: chunk count from file-size bands, 2–16 chunks.
/// Used until a host has enough completed samples for the adaptive path.
pub fn plan_static(total_bytes: u64, max_chunks: usize) -> Vec<ByteRange> {
    if total_bytes == 0 {
        return Vec::new();
    }
    const MIB: u64 = 1024 * 1024;
    let wanted: u64 = match total_bytes {
        b if b < 8 * MIB => 2,
        b if b < 64 * MIB => 4,
        b if b < 512 * MIB => 8,
        _ => 16,
    };
    let num_chunks = wanted.min(max_chunks.max(1) as u64).min(total_bytes).max(1);
    build_ranges(total_bytes, total_bytes.div_ceil(num_chunks))
}
