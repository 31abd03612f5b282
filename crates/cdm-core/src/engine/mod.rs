//! The download engine: pulls ready downloads, drives them through probe →
//! plan → fetch → assemble, and answers pause/cancel/confirm intents.
//!
//! The engine owns no durable state. Every lifecycle step is a store
//! transition; in-memory components (breakers, metrics, worker pool) are
//! constructed by the embedder and passed in, so there are no process-wide
//! singletons to tear down out of order.

mod plan;
mod progress;
mod run;
mod slots;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::breaker::BreakerManager;
use crate::config::CdmConfig;
use crate::events::{Event, EventBus};
use crate::fetch::FetchTarget;
use crate::metrics::SessionMetrics;
use crate::pool::WorkerPool;
use crate::store::{Download, DownloadId, DownloadSpec, DownloadState, Store};

pub use run::RunOutcome;
pub use slots::HostSlots;

/// A pause/cancel request against an active download. Level-triggered: the
/// chunk tasks poll `stop`, and the teardown path reads `target`.
struct Intent {
    stop: Arc<AtomicBool>,
    target: Mutex<DownloadState>,
}

/// The orchestrator. Cheap to share via `Arc`.
pub struct Engine {
    store: Store,
    cfg: CdmConfig,
    target: Arc<dyn FetchTarget>,
    breakers: Arc<BreakerManager>,
    metrics: Arc<SessionMetrics>,
    pool: Arc<WorkerPool>,
    events: EventBus,
    slots: HostSlots,
    intents: Mutex<HashMap<DownloadId, Arc<Intent>>>,
    /// Downloads rejected by an open breaker, parked until the deadline.
    cooldowns: Mutex<HashMap<DownloadId, Instant>>,
}

impl Engine {
    pub fn new(
        store: Store,
        cfg: CdmConfig,
        target: Arc<dyn FetchTarget>,
        breakers: Arc<BreakerManager>,
        metrics: Arc<SessionMetrics>,
        pool: Arc<WorkerPool>,
        events: EventBus,
    ) -> Arc<Self> {
        let slots = HostSlots::new(cfg.max_parallel_downloads, cfg.max_connections_per_host);
        Arc::new(Self {
            store,
            cfg,
            target,
            breakers,
            metrics,
            pool,
            events,
            slots,
            intents: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the periodic maintenance: breaker counter sweeps and worker
    /// pool supervision. Call once after construction, inside a runtime.
    pub fn start_background(self: &Arc<Self>) {
        self.pool.start_maintenance();
        let engine = Arc::clone(self);
        let every = self.breakers.sweep_interval();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                engine.breakers.sweep();
            }
        });
    }

    /// Crash recovery: demote interrupted rows to `queued` and tell the
    /// boundary how many came back.
    pub async fn restore(&self) -> Result<u64> {
        let count = self.store.reconcile_on_startup().await?;
        self.events.publish(Event::DownloadsRestored { count });
        Ok(count)
    }

    /// Enqueue one download.
    pub async fn add(&self, spec: &DownloadSpec) -> Result<Download> {
        let download = self
            .store
            .add_download(spec, self.cfg.max_queue_size)
            .await?;
        self.events.publish(Event::DownloadStateChanged {
            id: download.id,
            state: download.state,
        });
        Ok(download)
    }

    /// Enqueue a batch (a folder drop), reporting progress per row.
    /// Returns `(added, failed)`.
    pub async fn add_many(&self, specs: &[DownloadSpec]) -> Result<(usize, usize)> {
        let total = specs.len();
        let mut added = 0;
        let mut failed = 0;
        for spec in specs {
            match self.add(spec).await {
                Ok(_) => added += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(id = spec.id, "batch add failed: {:#}", e);
                    self.events.publish(Event::ErrorNotification {
                        id: Some(spec.id),
                        kind: "internal",
                        message: format!("{:#}", e),
                    });
                }
            }
            self.events.publish(Event::FolderAddProgress {
                added: added + failed,
                total,
            });
        }
        self.events.publish(Event::FolderAddComplete { added, failed });
        Ok((added, failed))
    }

    /// Process the ready queue until it drains: up to
    /// `max_parallel_downloads` downloads in flight, ordered by priority
    /// then age. Returns the number of downloads that reached `completed`.
    pub async fn run_queue(self: &Arc<Self>) -> Result<u32> {
        let mut join_set: tokio::task::JoinSet<(DownloadId, Result<RunOutcome>)> =
            tokio::task::JoinSet::new();
        let mut active: Vec<DownloadId> = Vec::new();
        let mut completed = 0u32;

        loop {
            while join_set.len() < self.cfg.max_parallel_downloads.max(1) {
                let Some(download) = self.next_dispatchable(&active).await? else {
                    break;
                };
                let id = download.id;
                active.push(id);
                let engine = Arc::clone(self);
                let permit = self
                    .slots
                    .global()
                    .acquire_owned()
                    .await
                    .context("global slot semaphore closed")?;
                join_set.spawn(async move {
                    let _permit = permit;
                    let outcome = run::run_one(&engine, download).await;
                    (id, outcome)
                });
            }

            if join_set.is_empty() {
                // Nothing runnable; if downloads are merely cooling down
                // behind an open breaker, wait out the nearest deadline.
                let Some(wait) = self.nearest_cooldown() else {
                    break;
                };
                tokio::time::sleep(wait).await;
                continue;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (id, outcome) = joined.context("download task join")?;
            active.retain(|&a| a != id);
            match outcome {
                Ok(RunOutcome::Completed) => completed += 1,
                Ok(RunOutcome::BreakerOpen) => {
                    let deadline = Instant::now()
                        + Duration::from_millis(self.cfg.circuit_breaker.timeout_ms);
                    self.cooldowns
                        .lock()
                        .expect("cooldowns poisoned")
                        .insert(id, deadline);
                }
                Ok(RunOutcome::Requeued) => {
                    // Transient probe failure: back off one base delay so a
                    // flapping host is not hammered in a tight loop.
                    let deadline =
                        Instant::now() + Duration::from_millis(self.cfg.retry.base_delay_ms);
                    self.cooldowns
                        .lock()
                        .expect("cooldowns poisoned")
                        .insert(id, deadline);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(id, "download run failed internally: {:#}", e);
                    self.events.publish(Event::ErrorNotification {
                        id: Some(id),
                        kind: "internal",
                        message: format!("{:#}", e),
                    });
                }
            }
        }
        Ok(completed)
    }

    /// Pause a download: immediately when queued, as an intent when active.
    pub async fn pause(&self, id: DownloadId) -> Result<()> {
        if self.signal_intent(id, DownloadState::Paused) {
            // Persist right away when the row is already `downloading`; a
            // `starting` row is handled by the teardown path.
            if self.store.transition_state(id, DownloadState::Paused).await? {
                self.publish_state(id, DownloadState::Paused);
            }
            return Ok(());
        }
        if self.store.transition_state(id, DownloadState::Paused).await? {
            self.publish_state(id, DownloadState::Paused);
            return Ok(());
        }
        bail!("download {} cannot be paused from its current state", id)
    }

    /// Cancel a download from any cancellable state.
    pub async fn cancel(&self, id: DownloadId) -> Result<()> {
        if self.signal_intent(id, DownloadState::Cancelled) {
            if self
                .store
                .transition_state(id, DownloadState::Cancelled)
                .await?
            {
                self.publish_state(id, DownloadState::Cancelled);
            }
            return Ok(());
        }
        if self
            .store
            .transition_state(id, DownloadState::Cancelled)
            .await?
        {
            self.publish_state(id, DownloadState::Cancelled);
            return Ok(());
        }
        bail!("download {} cannot be cancelled from its current state", id)
    }

    /// Re-queue a paused download.
    pub async fn resume(&self, id: DownloadId) -> Result<()> {
        if self.store.transition_state(id, DownloadState::Queued).await? {
            self.publish_state(id, DownloadState::Queued);
            return Ok(());
        }
        bail!("download {} is not paused", id)
    }

    /// Answer a `needs_confirmation` download: record the overwrite decision
    /// and put it back in the queue.
    pub async fn confirm(&self, id: DownloadId, overwrite: bool) -> Result<()> {
        self.store.set_force_overwrite(id, overwrite).await?;
        if self.store.transition_state(id, DownloadState::Queued).await? {
            self.publish_state(id, DownloadState::Queued);
            return Ok(());
        }
        bail!("download {} is not awaiting confirmation", id)
    }

    /// User-initiated re-download of a completed row.
    pub async fn redownload(&self, id: DownloadId) -> Result<()> {
        if self.store.transition_state(id, DownloadState::Queued).await? {
            self.publish_state(id, DownloadState::Queued);
            return Ok(());
        }
        bail!("download {} is not completed", id)
    }

    /// Remove all terminal downloads.
    pub async fn clear(&self) -> Result<u64> {
        self.store.clear_downloads().await
    }

    /// Retention sweep: drop terminal rows older than `max_age`.
    pub async fn clean_history(&self, max_age: Duration) -> Result<u64> {
        let cutoff = crate::store::unix_millis() - max_age.as_millis() as i64;
        let removed = self.store.clean_history(cutoff).await?;
        self.events.publish(Event::HistoryCleaned { removed });
        Ok(removed)
    }

    /// Delete one download row (cascades to chunks and attempts).
    pub async fn delete(&self, id: DownloadId) -> Result<bool> {
        self.store.delete_download(id).await
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<BreakerManager> {
        &self.breakers
    }

    /// Shut the worker pool down (drains assembly tasks first).
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn publish_state(&self, id: DownloadId, state: DownloadState) {
        self.events.publish(Event::DownloadStateChanged { id, state });
    }

    /// Flag an active download's intent. Returns false when not active.
    fn signal_intent(&self, id: DownloadId, target: DownloadState) -> bool {
        let intents = self.intents.lock().expect("intents poisoned");
        let Some(intent) = intents.get(&id) else {
            return false;
        };
        *intent.target.lock().expect("intent poisoned") = target;
        intent.stop.store(true, Ordering::Relaxed);
        true
    }

    fn register_intent(&self, id: DownloadId) -> Arc<Intent> {
        let intent = Arc::new(Intent {
            stop: Arc::new(AtomicBool::new(false)),
            target: Mutex::new(DownloadState::Paused),
        });
        self.intents
            .lock()
            .expect("intents poisoned")
            .insert(id, Arc::clone(&intent));
        intent
    }

    fn unregister_intent(&self, id: DownloadId) {
        self.intents.lock().expect("intents poisoned").remove(&id);
    }

    /// Next queued download that is neither active nor cooling down.
    async fn next_dispatchable(&self, active: &[DownloadId]) -> Result<Option<Download>> {
        let now = Instant::now();
        {
            let mut cooldowns = self.cooldowns.lock().expect("cooldowns poisoned");
            cooldowns.retain(|_, deadline| *deadline > now);
        }
        let downloads = self.store.list_downloads().await?;
        let cooldowns = self.cooldowns.lock().expect("cooldowns poisoned");
        Ok(downloads.into_iter().find(|d| {
            d.state == DownloadState::Queued
                && !active.contains(&d.id)
                && !cooldowns.contains_key(&d.id)
        }))
    }

    fn nearest_cooldown(&self) -> Option<Duration> {
        let cooldowns = self.cooldowns.lock().expect("cooldowns poisoned");
        let now = Instant::now();
        cooldowns
            .values()
            .map(|deadline| deadline.saturating_duration_since(now))
            .min()
            .map(|d| d.max(Duration::from_millis(10)))
    }
}
