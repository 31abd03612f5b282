//! `cdm run` – process the queue until it drains.

use anyhow::Result;
use std::sync::Arc;

use cdm_core::breaker::BreakerManager;
use cdm_core::config::CdmConfig;
use cdm_core::engine::Engine;
use cdm_core::events::{Event, EventBus};
use cdm_core::fetch::{FetchTarget, HttpTarget};
use cdm_core::metrics::SessionMetrics;
use cdm_core::pool::WorkerPool;
use cdm_core::store::Store;

pub async fn run_scheduler(store: Store, cfg: CdmConfig, show_progress: bool) -> Result<()> {
    let engine = Engine::new(
        store,
        cfg.clone(),
        Arc::new(HttpTarget::new()) as Arc<dyn FetchTarget>,
        Arc::new(BreakerManager::new(cfg.circuit_breaker.clone())),
        Arc::new(SessionMetrics::new()),
        WorkerPool::new(cfg.worker_pool.clone()),
        EventBus::default(),
    );
    engine.start_background();

    let restored = engine.restore().await?;
    if restored > 0 {
        println!("Restored {} interrupted download(s) to the queue.", restored);
    }

    let printer = show_progress.then(|| {
        let mut events = engine.events().subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                print_event(&event);
            }
        })
    });

    let completed = engine.run_queue().await?;
    println!("Completed {} download(s).", completed);

    let metrics = engine.metrics().snapshot();
    if metrics.total_failed > 0 {
        println!("{} download(s) failed; see `cdm status`.", metrics.total_failed);
    }

    engine.shutdown().await;
    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::DownloadProgress {
            id,
            downloaded_bytes,
            total_bytes,
            progress,
        } => {
            println!(
                "[{}] {:>3.0}%  {} / {} bytes",
                id,
                progress * 100.0,
                downloaded_bytes,
                total_bytes
            );
        }
        Event::DownloadCompleted { id, save_path, .. } => {
            println!("[{}] completed -> {}", id, save_path);
        }
        Event::DownloadFailed { id, kind, message } => {
            println!("[{}] failed ({}): {}", id, kind, message);
        }
        Event::ChunkFailed {
            id,
            chunk_index,
            message,
            ..
        } => {
            println!("[{}] chunk {} failed: {}", id, chunk_index, message);
        }
        Event::NeedsConfirmation { id, reason } => {
            println!("[{}] needs confirmation: {}", id, reason);
        }
        _ => {}
    }
}
