use crate::blocking::{self, BlockingHandle, ThreadPool};
use crate::context::{self, Shared};
use crate::runtime::{Schedule, TaskOpts};
use crate::task::{self, Id, JoinHandle, Task};
use std::fmt;
use std::sync::Arc;

/// Handle to a runtime, usable from any thread.
///
/// Cloning is cheap. Holding a handle does not keep the worker threads alive:
/// tasks spawned after the runtime shut down are cancelled right away.
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl Handle {
    pub(crate) fn new(shared: Arc<Shared>) -> Handle {
        Handle { shared }
    }

    /// Returns a handle to the runtime driving the current thread.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime worker.
    #[track_caller]
    pub fn current() -> Handle {
        context::current_handle().expect("`Handle::current` called outside of a corio runtime")
    }

    pub fn try_current() -> Option<Handle> {
        context::current_handle()
    }

    /// Spawns a task. From a worker of this runtime the task is queued on the
    /// calling worker, from anywhere else it goes through the global queue.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_with(future, None, false)
    }

    /// Spawns a task through the global queue, any worker may run it first.
    pub fn spawn_mt<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_with(future, None, true)
    }

    pub(crate) fn spawn_with<F>(
        &self,
        future: F,
        opts: Option<TaskOpts>,
        global: bool,
    ) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (task, join) = task::new_task(future, opts, self.clone());

        if !self.shared.tasks.insert(&task) {
            tracing::debug!(task.id = %task.id(), "runtime is shut down, task cancelled");
            return join;
        }

        tracing::trace!(task.id = %task.id(), global, "spawned task");

        if global {
            self.shared.push_injector(task);
        } else {
            self.schedule(task);
        }

        join
    }

    /// Runs `f` on the blocking thread pool. See [`spawn_blocking`].
    ///
    /// [`spawn_blocking`]: crate::blocking::spawn_blocking
    pub fn spawn_blocking<F, T>(&self, f: F) -> BlockingHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        blocking::spawn_on(self, |_| f())
    }

    /// The pool running this runtime's blocking jobs.
    pub fn blocking_pool(&self) -> &ThreadPool {
        &self.shared.blocking
    }

    /// True when `self` and `other` point to the same runtime.
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Number of tasks spawned on this runtime that have not completed yet.
    pub fn num_alive_tasks(&self) -> usize {
        self.shared.tasks.len()
    }

    pub fn num_workers(&self) -> usize {
        self.shared.num_workers()
    }
}

impl Schedule for Handle {
    fn schedule(&self, task: Task) {
        if self.shared.is_shutdown() {
            task.shutdown();
            return;
        }

        let owner = task.header().owner();
        let stealable = task.is_stealable();

        if let Some(ctx) = context::current()
            && self.ptr_eq(&ctx.handle)
        {
            match owner {
                Some(owner) if owner != ctx.core.index && !stealable => {
                    self.shared.push_remote(owner, task);
                }
                _ => {
                    ctx.core.run_queue.push(task);

                    // Let idle peers steal the surplus.
                    if stealable && ctx.core.run_queue.len() > 1 && self.shared.num_workers() > 1 {
                        self.shared.unpark_one();
                    }
                }
            }
            return;
        }

        // Woken from a foreign thread.
        match owner {
            Some(owner) if !stealable => self.shared.push_remote(owner, task),
            _ => self.shared.push_injector(task),
        }
    }

    fn release(&self, id: &Id) {
        self.shared.tasks.remove(id);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("workers", &self.shared.num_workers())
            .field("tasks", &self.shared.tasks.len())
            .finish()
    }
}
