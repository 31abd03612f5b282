//! `cdm checksum <path>` – SHA-256 of a finished file.

use anyhow::Result;
use cdm_core::assemble::sha256_file;
use std::path::Path;

pub fn run_checksum(path: &Path) -> Result<()> {
    let digest = sha256_file(path, |_| {})?;
    println!("{}  {}", digest, path.display());
    Ok(())
}
