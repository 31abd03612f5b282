//! Attempt records and transition history (append-only diagnostics).

use anyhow::{Context, Result};
use sqlx::Row;

use super::db::{unix_millis, Store};
use super::types::{Attempt, DownloadId, DownloadState, HistoryEntry};

impl Store {
    /// Append an attempt record and bump the download's `attempts_count`.
    /// Attempt numbers are strictly increasing per download.
    pub async fn record_attempt(&self, id: DownloadId, error: &str) -> Result<Attempt> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM downloads WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            anyhow::bail!("download {} not found", id);
        }

        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 AS n FROM attempts WHERE download_id = ?1",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?
        .get("n");

        let now = unix_millis();
        sqlx::query(
            "INSERT INTO attempts (download_id, attempt_number, error, at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(next)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE downloads SET attempts_count = attempts_count + 1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        Self::bump_version(&mut tx).await?;
        tx.commit().await?;

        Ok(Attempt {
            download_id: id,
            attempt_number: next,
            error: error.to_string(),
            at: now,
        })
    }

    /// Attempt records for a download, oldest first.
    pub async fn get_attempts(&self, id: DownloadId) -> Result<Vec<Attempt>> {
        let rows = sqlx::query(
            "SELECT * FROM attempts WHERE download_id = ?1 ORDER BY attempt_number ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Attempt {
                download_id: row.get("download_id"),
                attempt_number: row.get("attempt_number"),
                error: row.get("error"),
                at: row.get("at"),
            })
            .collect())
    }

    /// State transition history for a download, oldest first.
    pub async fn get_history(&self, id: DownloadId) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query("SELECT * FROM history WHERE download_id = ?1 ORDER BY id ASC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let from_str: String = row.get("from_state");
                let to_str: String = row.get("to_state");
                Ok(HistoryEntry {
                    download_id: row.get("download_id"),
                    from_state: DownloadState::parse(&from_str)
                        .with_context(|| format!("unknown state in history: {}", from_str))?,
                    to_state: DownloadState::parse(&to_str)
                        .with_context(|| format!("unknown state in history: {}", to_str))?,
                    at: row.get("at"),
                })
            })
            .collect()
    }
}
