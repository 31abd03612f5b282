//! Chunk row operations: plan persistence and per-chunk progress.

use anyhow::{bail, Context, Result};
use sqlx::Row;

use super::db::Store;
use super::types::{ByteRange, Chunk, ChunkPatch, ChunkState, DownloadId, DownloadState};

/// Checks that `ranges` is a dense, gap-free, overlap-free partition of
/// `[0, total_bytes - 1]`.
pub(super) fn validate_partition(ranges: &[ByteRange], total_bytes: u64) -> Result<()> {
    if total_bytes == 0 {
        bail!("cannot partition a zero-byte download");
    }
    if ranges.is_empty() {
        bail!("empty chunk plan");
    }
    if ranges[0].start != 0 {
        bail!("plan does not start at byte 0 (starts at {})", ranges[0].start);
    }
    for pair in ranges.windows(2) {
        if pair[0].end >= pair[1].start {
            bail!(
                "overlapping ranges: [{}, {}] then [{}, {}]",
                pair[0].start,
                pair[0].end,
                pair[1].start,
                pair[1].end
            );
        }
        if pair[1].start != pair[0].end + 1 {
            bail!(
                "gap between byte {} and {}",
                pair[0].end,
                pair[1].start
            );
        }
    }
    let last = ranges[ranges.len() - 1];
    if last.end != total_bytes - 1 {
        bail!(
            "plan ends at byte {} but file ends at {}",
            last.end,
            total_bytes - 1
        );
    }
    Ok(())
}

impl Store {
    /// Atomically replace the chunk plan for a download.
    ///
    /// The parent must be in `starting` or `downloading`; `ranges` must be a
    /// valid partition of `[0, total_bytes - 1]`. Any previous plan rows are
    /// dropped in the same transaction.
    pub async fn create_chunks(&self, id: DownloadId, ranges: &[ByteRange]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state, total_bytes FROM downloads WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("download {} not found", id))?;
        let state_str: String = row.get("state");
        let state = DownloadState::parse(&state_str)
            .with_context(|| format!("unknown download state in db: {}", state_str))?;
        if !matches!(state, DownloadState::Starting | DownloadState::Downloading) {
            bail!(
                "chunks may only be created in starting/downloading (download {} is {})",
                id,
                state_str
            );
        }
        let total_bytes = row.get::<i64, _>("total_bytes") as u64;
        validate_partition(ranges, total_bytes)
            .with_context(|| format!("invalid chunk plan for download {}", id))?;

        sqlx::query("DELETE FROM chunks WHERE download_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for (index, range) in ranges.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO chunks (
                    download_id, chunk_index, start_byte, end_byte,
                    downloaded_bytes, state, attempts
                ) VALUES (?1, ?2, ?3, ?4, 0, 'pending', 0)
                "#,
            )
            .bind(id)
            .bind(index as i64)
            .bind(range.start as i64)
            .bind(range.end as i64)
            .execute(&mut *tx)
            .await?;
        }

        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Chunk rows for a download, in index order.
    pub async fn get_chunks(&self, id: DownloadId) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE download_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let state_str: String = row.get("state");
                let state = ChunkState::parse(&state_str)
                    .with_context(|| format!("unknown chunk state in db: {}", state_str))?;
                Ok(Chunk {
                    download_id: row.get("download_id"),
                    chunk_index: row.get("chunk_index"),
                    start_byte: row.get::<i64, _>("start_byte") as u64,
                    end_byte: row.get::<i64, _>("end_byte") as u64,
                    downloaded_bytes: row.get::<i64, _>("downloaded_bytes") as u64,
                    state,
                    attempts: row.get("attempts"),
                    error: row.get("error"),
                })
            })
            .collect()
    }

    /// Apply a partial update to one chunk. `downloaded_bytes` is monotonic:
    /// a lower value than the stored one is kept at the stored value.
    pub async fn update_chunk_progress(
        &self,
        id: DownloadId,
        index: i64,
        patch: &ChunkPatch,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT downloaded_bytes, state, attempts, error FROM chunks WHERE download_id = ?1 AND chunk_index = ?2",
        )
        .bind(id)
        .bind(index)
        .fetch_optional(&mut *tx)
        .await?
        .with_context(|| format!("chunk {}/{} not found", id, index))?;

        let current_bytes = row.get::<i64, _>("downloaded_bytes") as u64;
        let downloaded = patch
            .downloaded_bytes
            .map(|b| b.max(current_bytes))
            .unwrap_or(current_bytes);
        let state = match patch.state {
            Some(s) => s.as_str().to_string(),
            None => row.get::<String, _>("state"),
        };
        let attempts: i64 = patch.attempts.unwrap_or_else(|| row.get("attempts"));
        let error = match &patch.error {
            Some(v) => v.clone(),
            None => row.get::<Option<String>, _>("error"),
        };

        sqlx::query(
            r#"
            UPDATE chunks
            SET downloaded_bytes = ?1, state = ?2, attempts = ?3, error = ?4
            WHERE download_id = ?5 AND chunk_index = ?6
            "#,
        )
        .bind(downloaded as i64)
        .bind(&state)
        .bind(attempts)
        .bind(&error)
        .bind(id)
        .bind(index)
        .execute(&mut *tx)
        .await?;

        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
