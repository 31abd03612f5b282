//! Connection slots: a global cap on active downloads plus per-host caps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::host::HostKey;

/// Semaphores bounding concurrency. The global semaphore is acquired once
/// per active download; a host semaphore once per in-flight chunk, so all
/// downloads hitting one host share its connection budget.
pub struct HostSlots {
    global: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<HostKey, Arc<Semaphore>>>,
}

impl HostSlots {
    pub fn new(max_parallel_downloads: usize, max_connections_per_host: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_parallel_downloads.max(1))),
            per_host_limit: max_connections_per_host.max(1),
            per_host: Mutex::new(HashMap::new()),
        }
    }

    /// Semaphore gating active downloads.
    pub fn global(&self) -> Arc<Semaphore> {
        Arc::clone(&self.global)
    }

    /// Semaphore gating connections to one host.
    pub fn host(&self, key: &HostKey) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().expect("slots poisoned");
        Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit))),
        )
    }
}
