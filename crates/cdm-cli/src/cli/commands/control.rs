//! Queue control: pause, resume, cancel, remove, clear.

use anyhow::{bail, Result};
use cdm_core::store::{DownloadState, Store};

pub async fn run_pause(store: &Store, id: i64) -> Result<()> {
    if store.transition_state(id, DownloadState::Paused).await? {
        println!("Paused download {}.", id);
        return Ok(());
    }
    bail!("download {} cannot be paused from its current state", id)
}

pub async fn run_resume(store: &Store, id: i64) -> Result<()> {
    if store.transition_state(id, DownloadState::Queued).await? {
        println!("Resumed download {}.", id);
        return Ok(());
    }
    bail!("download {} cannot be resumed from its current state", id)
}

pub async fn run_cancel(store: &Store, id: i64) -> Result<()> {
    if store.transition_state(id, DownloadState::Cancelled).await? {
        println!("Cancelled download {}.", id);
        return Ok(());
    }
    bail!("download {} cannot be cancelled from its current state", id)
}

pub async fn run_remove(store: &Store, id: i64) -> Result<()> {
    if store.delete_download(id).await? {
        println!("Removed download {}.", id);
        return Ok(());
    }
    bail!("no download with id {}", id)
}

pub async fn run_clear(store: &Store) -> Result<()> {
    let removed = store.clear_downloads().await?;
    println!("Cleared {} finished download(s).", removed);
    Ok(())
}
