//! Download row operations: enqueue, state transitions, patches, sweeps.

use anyhow::{bail, Context, Result};
use sqlx::Row;

use super::db::{unix_millis, Store};
use super::machine::transition_allowed;
use super::types::{Download, DownloadId, DownloadPatch, DownloadSpec, DownloadState};

impl Store {
    /// Enqueue a download in `queued`.
    ///
    /// Idempotent: a second add with an existing id returns the existing row
    /// unchanged (no version bump). Fails fast when the queue already holds
    /// `max_queue_size` non-terminal downloads.
    pub async fn add_download(
        &self,
        spec: &DownloadSpec,
        max_queue_size: usize,
    ) -> Result<Download> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT * FROM downloads WHERE id = ?1")
            .bind(spec.id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = existing {
            tx.commit().await?;
            return Self::row_to_download(&row);
        }

        let queued: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM downloads WHERE state NOT IN ('completed', 'failed', 'cancelled')",
        )
        .fetch_one(&mut *tx)
        .await?
        .get("n");
        if queued as usize >= max_queue_size {
            bail!("queue is full ({} downloads)", max_queue_size);
        }

        let now = unix_millis();
        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, title, url, save_path, total_bytes, downloaded_bytes,
                progress, state, priority, created_at, updated_at, attempts_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0.0, ?6, ?7, ?8, ?8, 0)
            "#,
        )
        .bind(spec.id)
        .bind(&spec.title)
        .bind(&spec.url)
        .bind(&spec.save_path)
        .bind(spec.total_bytes as i64)
        .bind(DownloadState::Queued.as_str())
        .bind(spec.priority)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        Self::bump_version(&mut tx).await?;

        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?1")
            .bind(spec.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Self::row_to_download(&row)
    }

    /// Attempt the transition `current -> new_state`.
    ///
    /// Returns true iff the edge is legal and the row was updated; false
    /// leaves the row untouched (including unknown ids). Side effects on
    /// success: timestamps, history row, chunk cleanup on terminal states,
    /// counter reset on re-download, version bump.
    pub async fn transition_state(
        &self,
        id: DownloadId,
        new_state: DownloadState,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query("SELECT state FROM downloads WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(false);
        };
        let state_str: String = row.get("state");
        let current = DownloadState::parse(&state_str)
            .with_context(|| format!("unknown download state in db: {}", state_str))?;

        if !transition_allowed(current, new_state) {
            tracing::debug!(id, from = %state_str, to = new_state.as_str(), "transition rejected");
            return Ok(false);
        }

        let now = unix_millis();
        match new_state {
            DownloadState::Starting => {
                sqlx::query(
                    "UPDATE downloads SET state = ?1, started_at = ?2, updated_at = ?2 WHERE id = ?3",
                )
                .bind(new_state.as_str())
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            DownloadState::Completed => {
                sqlx::query(
                    "UPDATE downloads SET state = ?1, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
                )
                .bind(new_state.as_str())
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            DownloadState::Queued if current == DownloadState::Completed => {
                // Re-download: the counter describes the new run; attempt
                // rows stay as history.
                sqlx::query(
                    r#"
                    UPDATE downloads
                    SET state = ?1, downloaded_bytes = 0, progress = 0.0,
                        attempts_count = 0, error_message = NULL,
                        started_at = NULL, completed_at = NULL, updated_at = ?2
                    WHERE id = ?3
                    "#,
                )
                .bind(new_state.as_str())
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            _ => {
                sqlx::query("UPDATE downloads SET state = ?1, updated_at = ?2 WHERE id = ?3")
                    .bind(new_state.as_str())
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        // Chunks are owned by the parent; a terminal parent has no live plan.
        if new_state.is_terminal() {
            sqlx::query("DELETE FROM chunks WHERE download_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO history (download_id, from_state, to_state, at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(current.as_str())
        .bind(new_state.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Apply a partial update to a download row.
    ///
    /// Rejects patches that would decrease `downloaded_bytes` or drive
    /// `progress` outside [0, 1].
    pub async fn update_download(&self, id: DownloadId, patch: &DownloadPatch) -> Result<Download> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("download {} not found", id))?;
        let current = Self::row_to_download(&row)?;

        if let Some(p) = patch.progress {
            if !(0.0..=1.0).contains(&p) {
                bail!("progress {} outside [0, 1] for download {}", p, id);
            }
        }
        if let Some(b) = patch.downloaded_bytes {
            if b < current.downloaded_bytes {
                bail!(
                    "downloaded_bytes may not decrease ({} -> {}) for download {}",
                    current.downloaded_bytes,
                    b,
                    id
                );
            }
        }

        let progress = patch.progress.unwrap_or(current.progress);
        let downloaded = patch.downloaded_bytes.unwrap_or(current.downloaded_bytes);
        let total = patch.total_bytes.unwrap_or(current.total_bytes);
        let error_message = match &patch.error_message {
            Some(v) => v.clone(),
            None => current.error_message.clone(),
        };

        let now = unix_millis();
        sqlx::query(
            r#"
            UPDATE downloads
            SET progress = ?1, downloaded_bytes = ?2, total_bytes = ?3,
                error_message = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(progress)
        .bind(downloaded as i64)
        .bind(total as i64)
        .bind(&error_message)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        Self::bump_version(&mut tx).await?;

        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Self::row_to_download(&row)
    }

    /// Fetch a single download.
    pub async fn get_download(&self, id: DownloadId) -> Result<Option<Download>> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_download).transpose()
    }

    /// All downloads, ready-queue order first (priority desc, then age).
    pub async fn list_downloads(&self) -> Result<Vec<Download>> {
        let rows = sqlx::query(
            "SELECT * FROM downloads ORDER BY priority DESC, created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_download).collect()
    }

    /// Next `queued` download to dispatch, or None when the queue is drained.
    pub async fn next_queued(&self) -> Result<Option<Download>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM downloads
            WHERE state = 'queued'
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_download).transpose()
    }

    /// Remove all downloads in a terminal state. Returns the count removed.
    pub async fn clear_downloads(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let r = sqlx::query(
            "DELETE FROM downloads WHERE state IN ('completed', 'failed', 'cancelled')",
        )
        .execute(&mut *tx)
        .await?;
        let removed = r.rows_affected();
        if removed > 0 {
            Self::bump_version(&mut tx).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Remove terminal downloads not touched since `cutoff_millis`.
    /// Retention sweep behind the `history-cleaned` event.
    pub async fn clean_history(&self, cutoff_millis: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let r = sqlx::query(
            r#"
            DELETE FROM downloads
            WHERE state IN ('completed', 'failed', 'cancelled') AND updated_at < ?1
            "#,
        )
        .bind(cutoff_millis)
        .execute(&mut *tx)
        .await?;
        let removed = r.rows_affected();
        if removed > 0 {
            Self::bump_version(&mut tx).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Record the user's overwrite decision (needs-confirmation flow).
    pub async fn set_force_overwrite(&self, id: DownloadId, value: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = unix_millis();
        sqlx::query(
            "UPDATE downloads SET force_overwrite = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(value as i64)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete one download; chunks and attempts cascade. Returns true if a
    /// row was removed.
    pub async fn delete_download(&self, id: DownloadId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let r = sqlx::query("DELETE FROM downloads WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = r.rows_affected() > 0;
        if deleted {
            Self::bump_version(&mut tx).await?;
        }
        tx.commit().await?;
        Ok(deleted)
    }
}
