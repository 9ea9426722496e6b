use crate::context::{self, Core, Shared};
use crate::runtime::pool::WorkerPool;
use crate::runtime::worker::Worker;
use crate::runtime::{Handle, RuntimeConfig};
use crate::task::JoinHandle;
use crate::utils::ScopeGuard;
use crate::utils::thread::pin_current_thread;
use anyhow::{Context as _, Result, bail};
use crossbeam_deque::{Steal, Worker as CbWorker};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::pin::pin;
use std::sync::Arc;

// Use a thread_local variable to track if a runtime is already active on this thread.
thread_local! {
    static IS_RUNTIME_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// The corio runtime.
///
/// The thread that builds the runtime is its root worker (index 0): it drives
/// the future passed to [`Runtime::block_on`] and, while doing so, runs tasks
/// like any other worker. For this reason a `Runtime` stays on the thread
/// that created it.
///
/// Dropping the runtime shuts it down, see [`Runtime::shutdown`].
pub struct Runtime {
    handle: Handle,

    /// Root worker state, parked here between `block_on` calls.
    root: RefCell<Option<Core>>,

    pool: WorkerPool,
}

impl Runtime {
    pub(crate) fn try_new(cfg: RuntimeConfig) -> Result<Runtime> {
        if IS_RUNTIME_ACTIVE.get() || context::is_worker_thread() {
            bail!("Cannot create a new runtime: a runtime is already active on this thread.");
        }

        let queues = (0..cfg.num_workers())
            .map(|_| CbWorker::new_fifo())
            .collect::<Vec<_>>();

        let shared = Arc::new(Shared::new(cfg.clone(), queues.iter().map(CbWorker::stealer)));
        let handle = Handle::new(shared);

        let mut queues = queues.into_iter();
        let root_queue = queues.next().context("runtime has no root worker")?;

        if cfg.pin_workers
            && let Err(e) = pin_current_thread(0)
        {
            tracing::warn!(worker = 0, "failed to pin root worker: {}", e);
        }

        let root = Core::try_new(0, &cfg, root_queue)?;
        let pool = WorkerPool::start(&handle, queues.collect())?;

        IS_RUNTIME_ACTIVE.set(true);

        tracing::debug!(
            kind = ?cfg.kind,
            workers = cfg.num_workers(),
            "runtime started"
        );

        Ok(Runtime {
            handle,
            root: RefCell::new(Some(root)),
            pool,
        })
    }

    /// Runs a future to completion on the current thread, which acts as the
    /// root worker for the duration of the call.
    ///
    /// # Panics
    ///
    /// Panics when called from within a runtime worker, or when the root
    /// worker's reactor fails.
    #[track_caller]
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let core = self
            .root
            .borrow_mut()
            .take()
            .expect("`block_on` cannot be called recursively");

        let mut worker = Worker::new(&self.handle, core.index);
        let guard = context::enter(self.handle.clone(), core);

        // Put the core back even if the root future panics.
        let _restore = ScopeGuard::new(|| {
            *self.root.borrow_mut() = guard.exit();
        });

        let ctx = context::expect_current();
        let mut future = pin!(future);

        match worker.run(&ctx, Some(future.as_mut())) {
            Ok(Some(output)) => output,
            Ok(None) => panic!("runtime was shut down while `block_on` was running"),
            Err(e) => panic!("root worker failed: {e:#}"),
        }
    }

    /// Spawns a future onto the runtime. See [`Handle::spawn`].
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Shuts the runtime down.
    ///
    /// Worker threads stop at their next scheduling point and are joined.
    /// Every task that has not completed is dropped: its `JoinHandle`
    /// resolves with a cancelled error. In-flight kernel requests are
    /// cancelled and their memory released once the kernel gives it back.
    pub fn shutdown(self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        let shared = &self.handle.shared;
        if !shared.begin_shutdown() {
            return;
        }

        IS_RUNTIME_ACTIVE.set(false);
        shared.unpark_all();

        if let Err(e) = self.pool.join_all() {
            tracing::error!("error during runtime shutdown: {:#}", e);
        }

        // Tear down the root worker's tasks from inside its own context, so
        // their operations are orphaned into the right ring.
        if let Some(core) = self.root.borrow_mut().take() {
            if context::is_worker_thread() {
                drop(core);
            } else {
                let mut worker = Worker::new(&self.handle, core.index);
                let guard = context::enter(self.handle.clone(), core);
                worker.shutdown(&context::expect_current().core);
                drop(guard);
            }
        }

        loop {
            match shared.injector.steal() {
                Steal::Success(task) => task.shutdown(),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }

        shared.tasks.shutdown_all();
        shared.blocking.shutdown();

        tracing::debug!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
