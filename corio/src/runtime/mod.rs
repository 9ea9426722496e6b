//! The corio runtime: workers, scheduling and spawning.
//!
//! Two flavors share the same worker event loop:
//!
//! * **local**: a single worker, the thread calling [`Runtime::block_on`].
//! * **stealing**: `worker_threads` background workers plus the `block_on`
//!   thread. Idle workers steal ready tasks from busy ones, unless the task is
//!   sticky or has kernel requests in flight on its current worker's ring.
//!
//! Tasks are created with [`spawn`], [`spawn_mt`] or a [`SpawnBuilder`].
use crate::task::{Id, Task};

mod builder;
pub use builder::Builder;
pub(crate) use builder::{Kind, RuntimeConfig};

mod handle;
pub use handle::Handle;

mod pool;

mod registry;
pub(crate) use registry::OwnedTasks;

#[allow(clippy::module_inception)]
mod runtime;
pub use runtime::Runtime;

mod spawn;
pub use spawn::{SpawnBuilder, TaskOpts, spawn, spawn_builder, spawn_detached, spawn_mt};

mod ticker;

mod worker;

/// Inline capacity of small batches (slab reservations, linked entries).
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;

/// Scheduler trait, implemented by the runtime handle.
pub(crate) trait Schedule: Send + Sync + 'static {
    /// Schedule a task to run soon. Never polls it inline.
    fn schedule(&self, task: Task);

    /// The task completed or was cancelled, the runtime stops tracking it.
    fn release(&self, id: &Id);
}

#[cfg(test)]
mod tests;
