use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Global configuration loaded from `~/.config/cdm/config.toml`.
///
/// Every knob has a sensible default; an absent file is created with the
/// defaults on first run so users have something to edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CdmConfig {
    /// Upper bound on simultaneously active downloads.
    pub max_parallel_downloads: usize,
    /// Upper bound on in-flight chunks per download.
    pub max_concurrent_chunks: usize,
    /// Per-host connection cap (slots shared by all downloads on a host).
    pub max_connections_per_host: usize,
    /// Retry limit per chunk.
    pub max_chunk_retries: u32,
    /// Per-fetch timeout in milliseconds.
    pub chunk_operation_timeout_ms: u64,
    /// Minimum delay between published progress events per download.
    pub progress_batch_delay_ms: u64,
    /// Minimum new bytes before a progress event may be published early.
    pub progress_batch_bytes_threshold: u64,
    /// Queue capacity; `add_download` fails fast beyond this.
    pub max_queue_size: usize,
    /// Tolerance in bytes when matching on-disk chunk size during resume.
    pub size_margin_bytes: u64,

    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub adaptive_chunks: AdaptiveChunksConfig,
    pub worker_pool: WorkerPoolConfig,
}

impl Default for CdmConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: 3,
            max_concurrent_chunks: 4,
            max_connections_per_host: 8,
            max_chunk_retries: 5,
            chunk_operation_timeout_ms: 120_000,
            progress_batch_delay_ms: 250,
            progress_batch_bytes_threshold: 1024 * 1024,
            max_queue_size: 1000,
            size_margin_bytes: 0,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            adaptive_chunks: AdaptiveChunksConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
        }
    }
}

/// Backoff tuning for transient chunk failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay for exponential backoff, milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay, milliseconds.
    pub max_delay_ms: u64,
    /// Jitter applied to each delay, as a fraction (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

/// Circuit breaker thresholds, shared by the global and per-host breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures in CLOSED before the breaker opens.
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before the breaker closes.
    pub success_threshold: u32,
    /// How long an OPEN breaker rejects calls, milliseconds.
    pub timeout_ms: u64,
    /// CLOSED failure counter is cleared after this long without a failure.
    pub reset_timeout_ms: u64,
    /// Track one breaker per host instead of a single global one.
    pub per_host: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            reset_timeout_ms: 60_000,
            per_host: false,
        }
    }
}

/// Adaptive chunk sizing (speed bands) tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveChunksConfig {
    /// Master switch; when off the engine uses the static file-size bands.
    pub enabled: bool,
    /// Completed downloads required per host before trusting its speed.
    pub min_samples: usize,
    /// Lower clamp for the target chunk size in bytes.
    pub min_chunk_size: u64,
    /// Upper clamp for the target chunk size in bytes.
    pub max_chunk_size: u64,
    /// Lower clamp on chunk count per download.
    pub min_chunks: usize,
    /// Upper clamp on chunk count per download.
    pub max_chunks: usize,
}

impl Default for AdaptiveChunksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_samples: 2,
            min_chunk_size: 1024 * 1024,
            max_chunk_size: 128 * 1024 * 1024,
            min_chunks: 1,
            max_chunks: 16,
        }
    }
}

/// Worker pool sizing and supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Workers kept alive even when idle.
    pub min_workers: usize,
    /// Hard cap on workers; 0 = min(cpu_count - 1, 4).
    pub max_workers: usize,
    /// A task running longer than this is rejected and its worker replaced.
    pub task_timeout_ms: u64,
    /// A worker idle this long is destroyed (down to min_workers).
    pub idle_timeout_ms: u64,
    /// Interval between health-check sweeps.
    pub health_check_interval_ms: u64,
    /// A worker that does not ack a ping within this window is replaced.
    pub health_check_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 0,
            task_timeout_ms: 300_000,
            idle_timeout_ms: 60_000,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("cdm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<CdmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = CdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: CdmConfig = toml::from_str(&data)?;
    Ok(cfg)
}
