//! Bounded worker pool for blocking work (assembly, hashing).
//!
//! Workers are OS threads with a typed message inbox; the async side talks
//! to them through oneshot replies. The pool scales between `min_workers`
//! and `max_workers`, reaps idle workers, and replaces workers that stop
//! answering health pings or exceed the task timeout.

mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::WorkerPoolConfig;

pub use worker::TaskOutput;
use worker::{BoxedTask, WorkerHandle, WorkerReply, WorkerRequest};

/// Failure modes of `execute`.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("task exceeded the {0:?} timeout")]
    Timeout(Duration),
    #[error("worker died while running the task")]
    WorkerLost,
    #[error("task failed ({kind}): {message}")]
    Task { kind: String, message: String },
    #[error("task returned an unexpected output type")]
    OutputType,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_workers: usize,
    pub available: usize,
    pub busy: usize,
    pub waiting: usize,
    pub total_tasks_completed: u64,
    pub total_workers_created: u64,
    pub total_idle_destroys: u64,
    pub total_health_replacements: u64,
    pub is_shutting_down: bool,
}

struct QueuedJob {
    id: u64,
    task: BoxedTask,
    reply: tokio::sync::oneshot::Sender<WorkerReply>,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<WorkerHandle>,
    queue: VecDeque<QueuedJob>,
    /// task id -> worker id, for timeout attribution.
    in_flight: HashMap<u64, u64>,
}

/// The pool itself. Construct with `new`, then `start_maintenance` once a
/// tokio runtime is running.
pub struct WorkerPool {
    cfg: WorkerPoolConfig,
    max_workers: usize,
    state: Mutex<PoolState>,
    shutting_down: AtomicBool,
    next_worker_id: AtomicU64,
    next_task_id: AtomicU64,
    total_tasks_completed: AtomicU64,
    total_workers_created: AtomicU64,
    total_idle_destroys: AtomicU64,
    total_health_replacements: AtomicU64,
}

impl WorkerPool {
    pub fn new(cfg: WorkerPoolConfig) -> Arc<Self> {
        let min = cfg.min_workers.max(1);
        let max_workers = if cfg.max_workers == 0 {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            cpus.saturating_sub(1).clamp(1, 4)
        } else {
            cfg.max_workers
        }
        .max(min);

        let pool = Arc::new(Self {
            cfg,
            max_workers,
            state: Mutex::new(PoolState::default()),
            shutting_down: AtomicBool::new(false),
            next_worker_id: AtomicU64::new(1),
            next_task_id: AtomicU64::new(1),
            total_tasks_completed: AtomicU64::new(0),
            total_workers_created: AtomicU64::new(0),
            total_idle_destroys: AtomicU64::new(0),
            total_health_replacements: AtomicU64::new(0),
        });

        {
            let mut state = pool.state.lock().expect("pool poisoned");
            for _ in 0..min {
                let handle = pool.spawn_worker();
                state.workers.push(handle);
            }
        }
        pool
    }

    /// Spawn the idle-reap and health-check loops. Safe to call once; the
    /// loops stop when `shutdown` runs.
    pub fn start_maintenance(self: &Arc<Self>) {
        let idle_pool = Arc::clone(self);
        let idle_every = Duration::from_millis(self.cfg.idle_timeout_ms / 2).max(
            Duration::from_millis(10),
        );
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(idle_every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if idle_pool.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                idle_pool.reap_idle();
            }
        });

        let health_pool = Arc::clone(self);
        let health_every =
            Duration::from_millis(self.cfg.health_check_interval_ms).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(health_every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if health_pool.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                health_pool.health_check().await;
            }
        });
    }

    /// Run `f` on a worker and return its output.
    ///
    /// Dispatches to an idle worker, growing the pool up to `max_workers`;
    /// beyond that the task queues. A task that exceeds `task_timeout_ms`
    /// is rejected and its worker replaced.
    pub async fn execute<T, F>(&self, f: F) -> Result<T, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(PoolError::ShuttingDown);
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let boxed: BoxedTask = Box::new(move || f().map(|v| Box::new(v) as TaskOutput));
        self.dispatch_or_enqueue(task_id, boxed, reply_tx);

        let timeout = Duration::from_millis(self.cfg.task_timeout_ms);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                self.task_finished(task_id);
                match reply {
                    WorkerReply::Success { output, .. } => {
                        self.total_tasks_completed.fetch_add(1, Ordering::Relaxed);
                        output
                            .downcast::<T>()
                            .map(|b| *b)
                            .map_err(|_| PoolError::OutputType)
                    }
                    WorkerReply::Error { kind, message, .. } => {
                        self.total_tasks_completed.fetch_add(1, Ordering::Relaxed);
                        Err(PoolError::Task {
                            kind: kind.to_string(),
                            message,
                        })
                    }
                    WorkerReply::Pong { .. } => Err(PoolError::Task {
                        kind: "protocol".to_string(),
                        message: "unexpected pong for execute".to_string(),
                    }),
                }
            }
            Ok(Err(_closed)) => {
                self.replace_task_worker(task_id, "worker channel closed");
                Err(PoolError::WorkerLost)
            }
            Err(_elapsed) => {
                self.replace_task_worker(task_id, "task timeout");
                Err(PoolError::Timeout(timeout))
            }
        }
    }

    /// Reject new submissions, wait for in-flight and queued work to drain,
    /// then stop every worker.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);

        loop {
            let drained = {
                let state = self.state.lock().expect("pool poisoned");
                state.queue.is_empty() && state.in_flight.is_empty()
            };
            if drained {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let workers = {
            let mut state = self.state.lock().expect("pool poisoned");
            std::mem::take(&mut state.workers)
        };
        for mut handle in workers {
            let _ = handle.sender.send(WorkerRequest::Shutdown);
            if let Some(join) = handle.join.take() {
                let _ = tokio::task::spawn_blocking(move || join.join()).await;
            }
        }
        tracing::debug!("worker pool shut down");
    }

    /// Destroy workers idle for at least `idle_timeout_ms`, never dropping
    /// below `min_workers`. Called on the maintenance cadence.
    pub fn reap_idle(&self) {
        let idle_timeout = Duration::from_millis(self.cfg.idle_timeout_ms);
        let min = self.cfg.min_workers.max(1);
        let mut state = self.state.lock().expect("pool poisoned");

        while state.workers.len() > min {
            let Some(pos) = state
                .workers
                .iter()
                .position(|w| !w.busy && w.idle_since.elapsed() >= idle_timeout)
            else {
                break;
            };
            let handle = state.workers.remove(pos);
            let _ = handle.sender.send(WorkerRequest::Shutdown);
            self.total_idle_destroys.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(worker_id = handle.id, "idle worker destroyed");
        }
    }

    /// Ping idle workers; replace any that do not ack in time. Busy workers
    /// are supervised through the task timeout instead.
    pub async fn health_check(&self) {
        let ping_timeout = Duration::from_millis(self.cfg.health_check_timeout_ms);
        let mut pings = Vec::new();
        {
            let state = self.state.lock().expect("pool poisoned");
            for w in state.workers.iter().filter(|w| !w.busy) {
                let (tx, rx) = tokio::sync::oneshot::channel();
                let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
                // A dead inbox already answers the question.
                if w.sender.send(WorkerRequest::Ping { id, reply: tx }).is_err() {
                    pings.push((w.id, None));
                } else {
                    pings.push((w.id, Some(rx)));
                }
            }
        }

        let mut failed = Vec::new();
        for (worker_id, rx) in pings {
            match rx {
                None => failed.push(worker_id),
                Some(rx) => match tokio::time::timeout(ping_timeout, rx).await {
                    Ok(Ok(WorkerReply::Pong { .. })) => {}
                    _ => failed.push(worker_id),
                },
            }
        }

        if failed.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("pool poisoned");
        for worker_id in failed {
            // Re-check: the worker may have been reaped or become busy.
            let Some(pos) = state
                .workers
                .iter()
                .position(|w| w.id == worker_id && !w.busy)
            else {
                continue;
            };
            let old = state.workers.remove(pos);
            drop(old);
            let fresh = self.spawn_worker();
            tracing::warn!(worker_id, replacement = fresh.id, "unhealthy worker replaced");
            state.workers.push(fresh);
            self.total_health_replacements.fetch_add(1, Ordering::Relaxed);
            self.drain_queue_into_idle(&mut state);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().expect("pool poisoned");
        let busy = state.workers.iter().filter(|w| w.busy).count();
        PoolStats {
            total_workers: state.workers.len(),
            available: state.workers.len() - busy,
            busy,
            waiting: state.queue.len(),
            total_tasks_completed: self.total_tasks_completed.load(Ordering::Relaxed),
            total_workers_created: self.total_workers_created.load(Ordering::Relaxed),
            total_idle_destroys: self.total_idle_destroys.load(Ordering::Relaxed),
            total_health_replacements: self.total_health_replacements.load(Ordering::Relaxed),
            is_shutting_down: self.shutting_down.load(Ordering::Relaxed),
        }
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.total_workers_created.fetch_add(1, Ordering::Relaxed);
        WorkerHandle::spawn(id)
    }

    fn dispatch_or_enqueue(
        &self,
        task_id: u64,
        task: BoxedTask,
        reply: tokio::sync::oneshot::Sender<WorkerReply>,
    ) {
        let mut state = self.state.lock().expect("pool poisoned");

        if let Some(pos) = state.workers.iter().position(|w| !w.busy) {
            Self::send_to_worker(&mut state, pos, task_id, task, reply);
            return;
        }
        if state.workers.len() < self.max_workers {
            let handle = self.spawn_worker();
            state.workers.push(handle);
            let pos = state.workers.len() - 1;
            Self::send_to_worker(&mut state, pos, task_id, task, reply);
            return;
        }
        state.queue.push_back(QueuedJob {
            id: task_id,
            task,
            reply,
        });
    }

    fn send_to_worker(
        state: &mut PoolState,
        pos: usize,
        task_id: u64,
        task: BoxedTask,
        reply: tokio::sync::oneshot::Sender<WorkerReply>,
    ) {
        let worker = &mut state.workers[pos];
        worker.busy = true;
        state.in_flight.insert(task_id, worker.id);
        let _ = worker.sender.send(WorkerRequest::Execute {
            id: task_id,
            task,
            reply,
        });
    }

    /// A reply arrived: free the worker and hand it queued work.
    fn task_finished(&self, task_id: u64) {
        let mut state = self.state.lock().expect("pool poisoned");
        let Some(worker_id) = state.in_flight.remove(&task_id) else {
            return;
        };
        if let Some(w) = state.workers.iter_mut().find(|w| w.id == worker_id) {
            w.busy = false;
            w.idle_since = Instant::now();
        }
        self.drain_queue_into_idle(&mut state);
    }

    /// A task timed out or its worker vanished: drop the worker (its thread
    /// is detached and exits whenever the stuck task returns) and spawn a
    /// replacement. A task still sitting in the queue is simply removed.
    fn replace_task_worker(&self, task_id: u64, reason: &str) {
        let mut state = self.state.lock().expect("pool poisoned");

        if let Some(pos) = state.queue.iter().position(|job| job.id == task_id) {
            state.queue.remove(pos);
            return;
        }
        let Some(worker_id) = state.in_flight.remove(&task_id) else {
            return;
        };
        if let Some(pos) = state.workers.iter().position(|w| w.id == worker_id) {
            let mut old = state.workers.remove(pos);
            old.join.take(); // detach
            drop(old);
            let fresh = self.spawn_worker();
            tracing::warn!(worker_id, replacement = fresh.id, reason, "worker replaced");
            state.workers.push(fresh);
        }
        self.drain_queue_into_idle(&mut state);
    }

    fn drain_queue_into_idle(&self, state: &mut PoolState) {
        while !state.queue.is_empty() {
            let Some(pos) = state.workers.iter().position(|w| !w.busy) else {
                break;
            };
            let Some(job) = state.queue.pop_front() else {
                break;
            };
            Self::send_to_worker(state, pos, job.id, job.task, job.reply);
        }
    }

    #[cfg(test)]
    fn kill_first_idle_worker(&self) -> Option<u64> {
        let state = self.state.lock().expect("pool poisoned");
        let w = state.workers.iter().find(|w| !w.busy)?;
        let _ = w.sender.send(WorkerRequest::Shutdown);
        Some(w.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: 1,
            max_workers: 2,
            task_timeout_ms: 500,
            idle_timeout_ms: 50,
            health_check_interval_ms: 1000,
            health_check_timeout_ms: 100,
        }
    }

    #[tokio::test]
    async fn execute_returns_typed_output() {
        let pool = WorkerPool::new(cfg());
        let n = pool.execute(|| Ok::<u64, String>(6 * 7)).await.unwrap();
        assert_eq!(n, 42);
        assert_eq!(pool.stats().total_tasks_completed, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn task_errors_surface_with_kind() {
        let pool = WorkerPool::new(cfg());
        let err = pool
            .execute(|| Err::<u64, String>("no space".to_string()))
            .await
            .unwrap_err();
        match err {
            PoolError::Task { kind, message } => {
                assert_eq!(kind, "task");
                assert_eq!(message, "no space");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(cfg());
        let err = pool
            .execute(|| -> Result<u64, String> { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Task { ref kind, .. } if kind == "panic"));

        // The same worker still serves tasks.
        let n = pool.execute(|| Ok::<u64, String>(7)).await.unwrap();
        assert_eq!(n, 7);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn pool_grows_to_max_and_queues_beyond() {
        let pool = WorkerPool::new(cfg());

        let slow = |ms: u64| {
            move || {
                std::thread::sleep(Duration::from_millis(ms));
                Ok::<u64, String>(ms)
            }
        };
        let a = tokio::spawn({
            let p = Arc::clone(&pool);
            async move { p.execute(slow(150)).await }
        });
        let b = tokio::spawn({
            let p = Arc::clone(&pool);
            async move { p.execute(slow(150)).await }
        });
        let c = tokio::spawn({
            let p = Arc::clone(&pool);
            async move { p.execute(slow(50)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pool.stats();
        assert!(stats.total_workers <= 2, "never exceeds max_workers");
        assert_eq!(stats.busy, 2);
        assert_eq!(stats.waiting, 1, "third task queues");

        assert_eq!(a.await.unwrap().unwrap(), 150);
        assert_eq!(b.await.unwrap().unwrap(), 150);
        assert_eq!(c.await.unwrap().unwrap(), 50);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_rejects_task_and_replaces_worker() {
        let mut c = cfg();
        c.task_timeout_ms = 80;
        c.max_workers = 1;
        let pool = WorkerPool::new(c);
        let created_before = pool.stats().total_workers_created;

        let err = pool
            .execute(|| {
                std::thread::sleep(Duration::from_secs(2));
                Ok::<u64, String>(0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));

        let stats = pool.stats();
        assert_eq!(stats.total_workers, 1);
        assert_eq!(stats.total_workers_created, created_before + 1);

        // The replacement worker serves new tasks immediately.
        let n = pool.execute(|| Ok::<u64, String>(5)).await.unwrap();
        assert_eq!(n, 5);
    }

    #[tokio::test]
    async fn idle_workers_reaped_down_to_min() {
        let pool = WorkerPool::new(cfg());
        // Force growth to two workers.
        let a = tokio::spawn({
            let p = Arc::clone(&pool);
            async move {
                p.execute(|| {
                    std::thread::sleep(Duration::from_millis(80));
                    Ok::<(), String>(())
                })
                .await
            }
        });
        let b = tokio::spawn({
            let p = Arc::clone(&pool);
            async move {
                p.execute(|| {
                    std::thread::sleep(Duration::from_millis(80));
                    Ok::<(), String>(())
                })
                .await
            }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(pool.stats().total_workers, 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        pool.reap_idle();

        let stats = pool.stats();
        assert_eq!(stats.total_workers, 1, "trends back to min_workers");
        assert_eq!(stats.total_idle_destroys, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn health_check_replaces_dead_worker() {
        let pool = WorkerPool::new(cfg());
        let killed = pool.kill_first_idle_worker().unwrap();
        // Give the thread a moment to exit its loop.
        tokio::time::sleep(Duration::from_millis(30)).await;

        pool.health_check().await;

        let stats = pool.stats();
        assert_eq!(stats.total_workers, 1);
        assert_eq!(stats.total_health_replacements, 1);

        let n = pool.execute(|| Ok::<u64, String>(9)).await.unwrap();
        assert_eq!(n, 9);
        let state = pool.state.lock().unwrap();
        assert!(state.workers.iter().all(|w| w.id != killed));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let pool = WorkerPool::new(cfg());
        pool.shutdown().await;
        assert!(pool.stats().is_shutting_down);
        let err = pool.execute(|| Ok::<u64, String>(1)).await.unwrap_err();
        assert!(matches!(err, PoolError::ShuttingDown));
    }
}
