use crate::runtime::RuntimeConfig;
use crate::task::{Id, Task};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// Every task owned by the runtime. Ready queues and wakers only hold clones of
// a `Task`: the registry is what lets shutdown reach tasks that are idle and
// not referenced by any queue.
//
// The container is shared by all workers, so we keep contention low with a
// sharded map.
#[derive(Debug)]
pub(crate) struct OwnedTasks {
    tasks: DashMap<Id, Task>,

    // Keep track of size separately because DashMap impl for len iterates over
    // all shards.
    size: AtomicUsize,

    // Closed when we are shutting down. This is to prevent adding new tasks
    // and guarantee shutdown is only called once.
    closed: AtomicBool,
}

impl OwnedTasks {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            tasks: DashMap::with_capacity(cfg.sq_ring_size),
            size: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a new task. A closed registry shuts the task down instead and
    /// returns `false`.
    pub(crate) fn insert(&self, task: &Task) -> bool {
        if self.is_closed() {
            task.clone().shutdown();
            return false;
        }

        self.size.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(task.id(), task.clone());
        true
    }

    pub(crate) fn remove(&self, id: &Id) -> Option<Task> {
        self.tasks.remove(id).map(|(_id, task)| {
            self.size.fetch_sub(1, Ordering::Relaxed);
            task
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Removes the tasks last polled by `worker` so they can be dropped on
    /// the thread owning their in-flight operations.
    pub(crate) fn drain_owned_by(&self, worker: usize) -> Vec<Task> {
        // Collect ids first: removing while iterating would deadlock the shard.
        let ids = self
            .tasks
            .iter()
            .filter(|entry| entry.value().header().owner() == Some(worker))
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Shuts down every remaining task from the calling thread.
    pub(crate) fn shutdown_all(&self) {
        self.close();

        // Leverage dashmap `raw-api` for more efficient locking and draining.
        let tasks = self
            .tasks
            .shards()
            .iter()
            .fold(Vec::with_capacity(self.len()), |mut acc, shard| {
                acc.extend(shard.write().drain().map(|(_id, task)| task.into_inner()));
                acc
            });

        self.size.store(0, Ordering::Relaxed);

        if !tasks.is_empty() {
            tracing::debug!(num_tasks = tasks.len(), "shutting down remaining tasks");
        }

        for task in tasks {
            task.shutdown();
        }
    }
}
