//! Worker pool: assignment of builds to workers with per-worker capacity

use crate::core::builder::{Builder, WorkerSelection};
use crate::core::config::Settings;
use crate::worker::{LocalWorker, WorkerError, WorkerExecutor};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

struct Slot {
    executor: Arc<dyn WorkerExecutor>,
    capacity: usize,
}

struct PoolInner {
    slots: Vec<Slot>,
    running: Mutex<Vec<usize>>,
    released: Notify,
}

impl PoolInner {
    fn release(&self, index: usize) {
        if let Ok(mut running) = self.running.lock() {
            running[index] = running[index].saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}

/// Registry of workers shared by all builds of a master
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// A worker assigned to one build
///
/// The slot is given back when the lease is dropped.
pub struct WorkerLease {
    pool: Arc<PoolInner>,
    index: usize,
    /// Borrowed from an ancestor build; holds no slot of its own
    shared: bool,
}

impl WorkerLease {
    pub fn name(&self) -> &str {
        self.pool.slots[self.index].executor.name()
    }

    pub fn executor(&self) -> Arc<dyn WorkerExecutor> {
        self.pool.slots[self.index].executor.clone()
    }

    /// A lease on the same worker that does not take another slot
    pub fn share(&self) -> WorkerLease {
        WorkerLease {
            pool: self.pool.clone(),
            index: self.index,
            shared: true,
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.shared {
            self.pool.release(self.index);
        }
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.name())
            .field("shared", &self.shared)
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool from executors and their capacities
    pub fn new(workers: Vec<(Arc<dyn WorkerExecutor>, usize)>) -> Self {
        let running = vec![0; workers.len()];
        let slots = workers
            .into_iter()
            .map(|(executor, capacity)| Slot { executor, capacity })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                slots,
                running: Mutex::new(running),
                released: Notify::new(),
            }),
        }
    }

    /// A pool of local workers as declared in the settings
    pub fn local(settings: &Settings) -> Self {
        Self::new(
            settings
                .workers
                .iter()
                .map(|w| {
                    let executor: Arc<dyn WorkerExecutor> = Arc::new(LocalWorker::new(&w.name));
                    (executor, w.max_builds)
                })
                .collect(),
        )
    }

    /// Worker names in declared order
    pub fn names(&self) -> Vec<&str> {
        self.inner.slots.iter().map(|s| s.executor.name()).collect()
    }

    /// Running builds on a worker
    pub fn load(&self, worker: &str) -> usize {
        let Some(index) = self.index_of(worker) else {
            return 0;
        };
        self.inner
            .running
            .lock()
            .map(|running| running[index])
            .unwrap_or(0)
    }

    fn index_of(&self, worker: &str) -> Option<usize> {
        self.inner.slots.iter().position(|s| s.executor.name() == worker)
    }

    fn candidates(&self, builder: &Builder) -> Vec<usize> {
        if builder.workers.is_empty() {
            (0..self.inner.slots.len()).collect()
        } else {
            builder
                .workers
                .iter()
                .filter_map(|name| self.index_of(name))
                .collect()
        }
    }

    /// Take a slot now, if the builder's rule finds one
    pub fn try_assign(&self, builder: &Builder) -> Option<WorkerLease> {
        let candidates = self.candidates(builder);
        let mut running = self.inner.running.lock().ok()?;

        let free = candidates
            .into_iter()
            .filter(|&i| running[i] < self.inner.slots[i].capacity);
        let chosen = match builder.next_worker {
            WorkerSelection::FirstAvailable => free.into_iter().next(),
            // min_by_key keeps the first of equal loads, so ties go to declared order
            WorkerSelection::LeastLoaded => free.min_by_key(|&i| running[i]),
        }?;

        running[chosen] += 1;
        Some(WorkerLease {
            pool: self.inner.clone(),
            index: chosen,
            shared: false,
        })
    }

    /// Assign a worker, waiting up to `wait` for a free slot
    ///
    /// A synchronous child may pass its waiting ancestor's lease; when that
    /// worker belongs to the builder's pool the child runs on it without
    /// taking another slot.
    pub async fn assign(
        &self,
        builder: &Builder,
        inherited: Option<&WorkerLease>,
        wait: Duration,
    ) -> Result<WorkerLease, WorkerError> {
        if let Some(parent) = inherited {
            if Arc::ptr_eq(&parent.pool, &self.inner) && self.candidates(builder).contains(&parent.index) {
                debug!(builder = %builder.name, worker = parent.name(), "Sharing parent's worker");
                return Ok(parent.share());
            }
        }

        let deadline = Instant::now() + wait;
        loop {
            let released = self.inner.released.notified();
            if let Some(lease) = self.try_assign(builder) {
                debug!(builder = %builder.name, worker = lease.name(), "Assigned worker");
                return Ok(lease);
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(WorkerError::NoneAvailable {
                    builder: builder.name.clone(),
                    waited_secs: wait.as_secs(),
                });
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("workers", &self.names()).finish()
    }
}
