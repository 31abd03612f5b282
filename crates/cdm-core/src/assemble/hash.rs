//! Streaming SHA-256 of a finished file.
//!
//! Off the hot path: runs after assembly, on the worker pool, reading in
//! buffer-sized slices so memory stays bounded for arbitrarily large files.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Compute SHA-256 of a file and return the digest as lowercase hex.
///
/// `progress` receives whole percentages (0..=100) as the read advances;
/// pass a no-op closure when nobody is watching.
pub fn sha256_file(path: &Path, mut progress: impl FnMut(u8)) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let total = f
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    let mut hasher = Sha256::new();
    let mut buf = [0u8; BUF_SIZE];
    let mut read_so_far = 0u64;
    let mut last_percent = 0u8;
    progress(0);
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read_so_far += n as u64;
        if total > 0 {
            let percent = ((read_so_far * 100) / total) as u8;
            if percent > last_percent {
                last_percent = percent;
                progress(percent);
            }
        }
    }
    if last_percent < 100 {
        progress(100);
    }
    let digest = hasher.finalize();
    Ok(hex::encode(digest))
}
