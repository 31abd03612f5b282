//! SQLite-backed store implementation: open, schema, crash recovery.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::{ChunkState, Download, DownloadState};

/// Handle to the SQLite-backed download queue.
///
/// The database file lives under the XDG state directory
/// (`~/.local/state/cdm/queue.db`). Cheap to clone; all clones share one
/// connection pool, and writes are serialized through transactions.
#[derive(Clone)]
pub struct Store {
    pub(super) pool: Pool<Sqlite>,
}

impl Store {
    /// Open (or create) the default queue database and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("cdm")?;
        let state_dir = xdg_dirs.get_state_home();
        tokio::fs::create_dir_all(&state_dir).await?;
        Self::open_at(&state_dir.join("queue.db")).await
    }

    /// Open (or create) a queue database at an explicit path.
    pub async fn open_at(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("open queue db at {}", path.display()))?;

        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database (tests). Single connection so the pool
    /// cannot hand back a different empty database.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // `meta` carries the snapshot version: a single row bumped inside
        // every mutating transaction. Chunks and attempts cascade with their
        // parent download. raw_sql so the whole script runs as one batch.
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                state_version INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO meta (id, state_version) VALUES (1, 0);

            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                save_path TEXT NOT NULL,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                progress REAL NOT NULL DEFAULT 0.0,
                state TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                updated_at INTEGER NOT NULL,
                error_message TEXT,
                attempts_count INTEGER NOT NULL DEFAULT 0,
                force_overwrite INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS chunks (
                download_id INTEGER NOT NULL
                    REFERENCES downloads(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                PRIMARY KEY (download_id, chunk_index)
            );

            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                download_id INTEGER NOT NULL
                    REFERENCES downloads(id) ON DELETE CASCADE,
                attempt_number INTEGER NOT NULL,
                error TEXT NOT NULL,
                at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                download_id INTEGER NOT NULL
                    REFERENCES downloads(id) ON DELETE CASCADE,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads(state);
            CREATE INDEX IF NOT EXISTS idx_attempts_download ON attempts(download_id);
            CREATE INDEX IF NOT EXISTS idx_history_download ON history(download_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Demote any `downloading` or `starting` rows to `queued` and reset
    /// `active` chunks to `pending` (crash recovery). Chunk rows are kept so
    /// the next run can resume from bytes already on disk.
    /// Returns the number of downloads demoted.
    pub async fn reconcile_on_startup(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let now = unix_millis();

        let r = sqlx::query(
            r#"
            UPDATE downloads
            SET state = 'queued', updated_at = ?1
            WHERE state IN ('downloading', 'starting')
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE chunks
            SET state = ?1
            WHERE state = ?2
            "#,
        )
        .bind(ChunkState::Pending.as_str())
        .bind(ChunkState::Active.as_str())
        .execute(&mut *tx)
        .await?;

        let demoted = r.rows_affected();
        if demoted > 0 {
            Self::bump_version(&mut tx).await?;
        }
        tx.commit().await?;

        if demoted > 0 {
            tracing::info!(count = demoted, "reconciled interrupted downloads to queued");
        }
        Ok(demoted)
    }

    /// Bump the snapshot version inside an open transaction and return the
    /// new value. Call from every mutating path.
    pub(super) async fn bump_version(tx: &mut Transaction<'_, Sqlite>) -> Result<i64> {
        sqlx::query("UPDATE meta SET state_version = state_version + 1 WHERE id = 1")
            .execute(&mut **tx)
            .await?;
        let row = sqlx::query("SELECT state_version FROM meta WHERE id = 1")
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.get::<i64, _>("state_version"))
    }

    /// Current snapshot version (no transaction).
    pub async fn state_version(&self) -> Result<i64> {
        let row = sqlx::query("SELECT state_version FROM meta WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("state_version"))
    }

    pub(super) fn row_to_download(row: &sqlx::sqlite::SqliteRow) -> Result<Download> {
        let state_str: String = row.get("state");
        let state = DownloadState::parse(&state_str)
            .with_context(|| format!("unknown download state in db: {}", state_str))?;
        Ok(Download {
            id: row.get("id"),
            title: row.get("title"),
            url: row.get("url"),
            save_path: row.get("save_path"),
            total_bytes: row.get::<i64, _>("total_bytes") as u64,
            downloaded_bytes: row.get::<i64, _>("downloaded_bytes") as u64,
            progress: row.get("progress"),
            state,
            priority: row.get("priority"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            updated_at: row.get("updated_at"),
            error_message: row.get("error_message"),
            attempts_count: row.get("attempts_count"),
            force_overwrite: row.get::<i64, _>("force_overwrite") != 0,
        })
    }
}

/// Milliseconds since the Unix epoch; the timestamp unit used throughout
/// the store.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
