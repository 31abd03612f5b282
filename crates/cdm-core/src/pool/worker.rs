//! Worker thread: message protocol and run loop.

use std::any::Any;
use std::sync::mpsc;
use std::thread;

/// Output of a pool task, downcast by the caller side of `execute`.
pub type TaskOutput = Box<dyn Any + Send>;

/// A unit of blocking work.
pub type BoxedTask = Box<dyn FnOnce() -> Result<TaskOutput, String> + Send + 'static>;

/// Requests a worker understands. Every request carries a correlation id.
pub(super) enum WorkerRequest {
    Ping {
        id: u64,
        reply: tokio::sync::oneshot::Sender<WorkerReply>,
    },
    Execute {
        id: u64,
        task: BoxedTask,
        reply: tokio::sync::oneshot::Sender<WorkerReply>,
    },
    Shutdown,
}

/// Replies a worker produces.
pub(super) enum WorkerReply {
    Pong {
        id: u64,
    },
    Success {
        id: u64,
        output: TaskOutput,
    },
    Error {
        id: u64,
        kind: &'static str,
        message: String,
    },
}

/// Handle the pool keeps per worker.
pub(super) struct WorkerHandle {
    pub(super) id: u64,
    pub(super) sender: mpsc::Sender<WorkerRequest>,
    pub(super) join: Option<thread::JoinHandle<()>>,
    pub(super) busy: bool,
    pub(super) idle_since: std::time::Instant,
}

impl WorkerHandle {
    /// Spawn a worker thread with an empty inbox.
    pub(super) fn spawn(id: u64) -> Self {
        let (tx, rx) = mpsc::channel::<WorkerRequest>();
        let join = thread::Builder::new()
            .name(format!("cdm-worker-{}", id))
            .spawn(move || run_worker(id, rx))
            .expect("spawn worker thread");
        WorkerHandle {
            id,
            sender: tx,
            join: Some(join),
            busy: false,
            idle_since: std::time::Instant::now(),
        }
    }
}

/// Worker loop: block on the inbox, answer pings, run tasks, exit on
/// shutdown or a closed channel.
fn run_worker(worker_id: u64, inbox: mpsc::Receiver<WorkerRequest>) {
    tracing::debug!(worker_id, "worker started");
    while let Ok(request) = inbox.recv() {
        match request {
            WorkerRequest::Ping { id, reply } => {
                let _ = reply.send(WorkerReply::Pong { id });
            }
            WorkerRequest::Execute { id, task, reply } => {
                // A panicking task must not take the worker loop down with it.
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
                let msg = match outcome {
                    Ok(Ok(output)) => WorkerReply::Success { id, output },
                    Ok(Err(message)) => WorkerReply::Error {
                        id,
                        kind: "task",
                        message,
                    },
                    Err(panic) => WorkerReply::Error {
                        id,
                        kind: "panic",
                        message: panic_message(&panic),
                    },
                };
                let _ = reply.send(msg);
            }
            WorkerRequest::Shutdown => break,
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
