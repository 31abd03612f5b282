//! The assembly procedure: staging, pipelined copy, verify, promote, clean.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::DownloadError;
use crate::fetch::{chunk_dir, chunk_file_path};

use super::buffers::BufferPool;

const BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Staging file adjacent to the destination, promoted by rename on success.
pub fn staging_path(save_path: &str) -> PathBuf {
    PathBuf::from(format!("{}.staging", save_path))
}

/// Inputs to one assembly run.
#[derive(Debug, Clone)]
pub struct AssembleParams {
    pub save_path: String,
    /// Number of chunk files, `<save_path>.part/0000` onward.
    pub chunk_count: usize,
    pub expected_size: u64,
    /// Unlink an existing destination instead of failing.
    pub force_overwrite: bool,
}

/// What a successful assembly did.
#[derive(Debug, Clone)]
pub struct AssembleReport {
    pub bytes_processed: u64,
    pub elapsed: Duration,
    pub chunks_deleted: usize,
}

/// Concatenate chunk files into the destination.
///
/// Blocking; run on the worker pool. On any failure the staging file is
/// unlinked and the original destination is untouched.
pub fn assemble(params: &AssembleParams) -> Result<AssembleReport, DownloadError> {
    let staging = staging_path(&params.save_path);
    if staging.exists() {
        std::fs::remove_file(&staging).map_err(DownloadError::Disk)?;
    }

    let started = Instant::now();
    let result = copy_chunks_to_staging(params, &staging);

    let bytes_processed = match result {
        Ok(n) => n,
        Err(e) => {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
    };

    if bytes_processed != params.expected_size {
        let _ = std::fs::remove_file(&staging);
        return Err(DownloadError::PartialTransfer {
            expected: params.expected_size,
            received: bytes_processed,
        });
    }

    let destination = Path::new(&params.save_path);
    if destination.exists() {
        if !params.force_overwrite {
            let _ = std::fs::remove_file(&staging);
            return Err(DownloadError::Disk(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("destination exists: {}", params.save_path),
            )));
        }
        std::fs::remove_file(destination).map_err(DownloadError::Disk)?;
    }
    std::fs::rename(&staging, destination).map_err(DownloadError::Disk)?;

    let chunks_deleted = remove_chunk_files(params);

    Ok(AssembleReport {
        bytes_processed,
        elapsed: started.elapsed(),
        chunks_deleted,
    })
}

/// Copy every chunk in index order into the staging file.
///
/// Double-buffer pipeline: a reader thread fills one pooled buffer while
/// this thread writes the other, so read and write I/O overlap.
fn copy_chunks_to_staging(params: &AssembleParams, staging: &Path) -> Result<u64, DownloadError> {
    let mut out = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(staging)
        .map_err(DownloadError::Disk)?;

    let pool = Arc::new(BufferPool::new(2, BUFFER_SIZE));
    let (filled_tx, filled_rx) = mpsc::sync_channel::<Result<(Vec<u8>, usize), String>>(2);

    let reader_pool = Arc::clone(&pool);
    let save_path = params.save_path.clone();
    let chunk_count = params.chunk_count;
    let reader = std::thread::Builder::new()
        .name("cdm-assemble-read".to_string())
        .spawn(move || {
            for index in 0..chunk_count {
                let path = chunk_file_path(&save_path, index as i64);
                let mut file = match File::open(&path) {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = filled_tx.send(Err(format!("open {}: {}", path.display(), e)));
                        return;
                    }
                };
                loop {
                    let mut buf = reader_pool.acquire();
                    match file.read(&mut buf) {
                        Ok(0) => {
                            reader_pool.release(buf);
                            break;
                        }
                        Ok(n) => {
                            if filled_tx.send(Ok((buf, n))).is_err() {
                                return; // writer bailed
                            }
                        }
                        Err(e) => {
                            reader_pool.release(buf);
                            let _ =
                                filled_tx.send(Err(format!("read {}: {}", path.display(), e)));
                            return;
                        }
                    }
                }
            }
            // Sender drops here: end of stream.
        })
        .map_err(|e| DownloadError::Internal(format!("spawn assembler reader: {}", e)))?;

    let mut bytes_processed = 0u64;
    let mut failure: Option<DownloadError> = None;
    for message in filled_rx {
        match message {
            Ok((buf, n)) => {
                if failure.is_none() {
                    if let Err(e) = out.write_all(&buf[..n]) {
                        failure = Some(DownloadError::Disk(e));
                    } else {
                        bytes_processed += n as u64;
                    }
                }
                pool.release(buf);
            }
            Err(message) => {
                failure = Some(DownloadError::Disk(std::io::Error::other(message)));
                break;
            }
        }
    }
    let _ = reader.join();

    if let Some(e) = failure {
        return Err(e);
    }
    out.sync_all().map_err(DownloadError::Disk)?;
    drop(out);
    Ok(bytes_processed)
}

/// Best-effort cleanup of chunk files; the directory goes too once empty.
fn remove_chunk_files(params: &AssembleParams) -> usize {
    let mut deleted = 0;
    for index in 0..params.chunk_count {
        let path = chunk_file_path(&params.save_path, index as i64);
        if std::fs::remove_file(&path).is_ok() {
            deleted += 1;
        }
    }
    let dir = chunk_dir(&params.save_path);
    if std::fs::remove_dir(&dir).is_ok() {
        tracing::debug!(dir = %dir.display(), "chunk directory removed");
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_chunks(save_path: &str, parts: &[&[u8]]) {
        std::fs::create_dir_all(chunk_dir(save_path)).unwrap();
        for (i, part) in parts.iter().enumerate() {
            std::fs::write(chunk_file_path(save_path, i as i64), part).unwrap();
        }
    }

    #[test]
    fn concatenates_chunks_in_order_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("out.bin").to_string_lossy().to_string();
        let parts: Vec<Vec<u8>> = vec![vec![1u8; 300], vec![2u8; 300], vec![3u8; 150]];
        let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        write_chunks(&save, &refs);

        let report = assemble(&AssembleParams {
            save_path: save.clone(),
            chunk_count: 3,
            expected_size: 750,
            force_overwrite: false,
        })
        .unwrap();

        assert_eq!(report.bytes_processed, 750);
        assert_eq!(report.chunks_deleted, 3);

        let out = std::fs::read(&save).unwrap();
        let expected: Vec<u8> = parts.concat();
        assert_eq!(out, expected);

        assert!(!chunk_dir(&save).exists(), "chunk dir removed when empty");
        assert!(!staging_path(&save).exists());
    }

    #[test]
    fn large_multi_buffer_content_survives_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("big.bin").to_string_lossy().to_string();
        // Bigger than one pipeline buffer so several hops happen.
        let a: Vec<u8> = (0..5_000_000u32).map(|i| (i % 255) as u8).collect();
        let b: Vec<u8> = (0..2_500_000u32).map(|i| (i % 253) as u8).collect();
        write_chunks(&save, &[&a, &b]);

        let total = (a.len() + b.len()) as u64;
        let report = assemble(&AssembleParams {
            save_path: save.clone(),
            chunk_count: 2,
            expected_size: total,
            force_overwrite: false,
        })
        .unwrap();
        assert_eq!(report.bytes_processed, total);

        let out = std::fs::read(&save).unwrap();
        assert_eq!(out.len(), total as usize);
        assert_eq!(&out[..a.len()], a.as_slice());
        assert_eq!(&out[a.len()..], b.as_slice());
    }

    #[test]
    fn size_mismatch_fails_and_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("out.bin").to_string_lossy().to_string();
        write_chunks(&save, &[b"abc"]);

        let err = assemble(&AssembleParams {
            save_path: save.clone(),
            chunk_count: 1,
            expected_size: 10,
            force_overwrite: false,
        })
        .unwrap_err();
        assert!(matches!(err, DownloadError::PartialTransfer { .. }));
        assert!(!staging_path(&save).exists());
        assert!(!Path::new(&save).exists(), "destination never created");
        // Chunk files survive a failed assembly.
        assert!(chunk_file_path(&save, 0).exists());
    }

    #[test]
    fn missing_chunk_fails_without_touching_destination() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("out.bin").to_string_lossy().to_string();
        write_chunks(&save, &[b"abc"]);
        // Pre-existing destination must survive the failure.
        std::fs::write(&save, b"precious").unwrap();

        let err = assemble(&AssembleParams {
            save_path: save.clone(),
            chunk_count: 2, // 0001 does not exist
            expected_size: 6,
            force_overwrite: true,
        })
        .unwrap_err();
        assert!(matches!(err, DownloadError::Disk(_)));
        assert_eq!(std::fs::read(&save).unwrap(), b"precious");
        assert!(!staging_path(&save).exists());
    }

    #[test]
    fn existing_destination_requires_force_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("out.bin").to_string_lossy().to_string();
        write_chunks(&save, &[b"fresh!"]);
        std::fs::write(&save, b"old").unwrap();

        let err = assemble(&AssembleParams {
            save_path: save.clone(),
            chunk_count: 1,
            expected_size: 6,
            force_overwrite: false,
        })
        .unwrap_err();
        assert!(matches!(err, DownloadError::Disk(_)));
        assert_eq!(std::fs::read(&save).unwrap(), b"old");

        // Chunk files were not consumed, so a retry with overwrite works.
        write_chunks(&save, &[b"fresh!"]);
        assemble(&AssembleParams {
            save_path: save.clone(),
            chunk_count: 1,
            expected_size: 6,
            force_overwrite: true,
        })
        .unwrap();
        assert_eq!(std::fs::read(&save).unwrap(), b"fresh!");
    }

    #[test]
    fn stale_staging_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("out.bin").to_string_lossy().to_string();
        write_chunks(&save, &[b"data"]);
        std::fs::write(staging_path(&save), b"leftover from a crash").unwrap();

        assemble(&AssembleParams {
            save_path: save.clone(),
            chunk_count: 1,
            expected_size: 4,
            force_overwrite: false,
        })
        .unwrap();
        assert_eq!(std::fs::read(&save).unwrap(), b"data");
    }
}
