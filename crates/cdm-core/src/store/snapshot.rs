//! Versioned snapshot reads for incremental refresh.

use anyhow::Result;

use super::db::Store;
use super::types::Snapshot;

impl Store {
    /// Full download list plus the current snapshot version.
    ///
    /// `min_version` is the version the caller last saw; `has_changes` tells
    /// it whether anything was written since. Pass `None` (or 0) for an
    /// unconditional read.
    pub async fn get_snapshot(&self, min_version: Option<i64>) -> Result<Snapshot> {
        let state_version = self.state_version().await?;
        let downloads = self.list_downloads().await?;
        Ok(Snapshot {
            state_version,
            has_changes: state_version > min_version.unwrap_or(0),
            downloads,
        })
    }
}
