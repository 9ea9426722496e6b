use crate::reactor::{Reactor, UringReactor};
use crate::runtime::RuntimeConfig;
use crate::task::Task;
use crate::time::TimerTree;
use anyhow::Result;
use crossbeam_deque::Worker as CbWorker;
use std::cell::RefCell;
use std::time::Duration;

/// Per-worker state, owned by exactly one thread.
///
/// All fields use interior mutability so several of them can be borrowed at
/// once through the thread-local context.
pub(crate) struct Core {
    /// Position of the worker in `Shared::remotes`. The `block_on` thread is 0.
    pub(crate) index: usize,

    /// FIFO ready queue. Peers steal from the front through its `Stealer`.
    pub(crate) run_queue: CbWorker<Task>,

    /// Timed suspensions of tasks running on this worker.
    pub(crate) timers: RefCell<TimerTree>,

    pub(crate) reactor: RefCell<Box<dyn Reactor>>,

    drain_timeout: Duration,
}

impl Core {
    /// Must run on the thread that will drive the worker: the ring is created
    /// with `IORING_SETUP_SINGLE_ISSUER`.
    pub(crate) fn try_new(index: usize, cfg: &RuntimeConfig, run_queue: CbWorker<Task>) -> Result<Self> {
        let reactor = UringReactor::try_new(cfg)?;

        Ok(Core {
            index,
            run_queue,
            timers: RefCell::new(TimerTree::new()),
            reactor: RefCell::new(Box::new(reactor)),
            drain_timeout: cfg.shutdown_drain_timeout,
        })
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        tracing::debug!(worker = self.index, "draining reactor");
        self.reactor.get_mut().shutdown(self.drain_timeout);
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("index", &self.index)
            .field("ready", &self.run_queue.len())
            .field("timers", &self.timers.try_borrow().map(|t| t.len()).ok())
            .finish()
    }
}
