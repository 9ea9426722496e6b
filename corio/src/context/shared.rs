use crate::blocking::ThreadPool;
use crate::reactor::futex::futex_wake;
use crate::runtime::{OwnedTasks, RuntimeConfig};
use crate::task::Task;
use crossbeam_deque::{Injector, Stealer};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// The part of a worker other threads may touch.
#[derive(Debug)]
pub(crate) struct Remote {
    /// Steals from the front of the worker's ready queue.
    pub(crate) stealer: Stealer<Task>,

    /// Tasks pinned to this worker that were woken from another thread.
    inbox: Mutex<VecDeque<Task>>,

    /// Bumped on every unpark. A parked worker has a futex wait armed on it
    /// through its ring, so a `futex_wake` ends the blocking wait.
    pub(crate) wake_word: AtomicU32,

    parked: AtomicBool,
}

impl Remote {
    fn new(stealer: Stealer<Task>) -> Self {
        Remote {
            stealer,
            inbox: Mutex::new(VecDeque::new()),
            wake_word: AtomicU32::new(0),
            parked: AtomicBool::new(false),
        }
    }

    pub(crate) fn has_inbox(&self) -> bool {
        !self.inbox.lock().is_empty()
    }

    pub(crate) fn take_inbox(&self) -> VecDeque<Task> {
        std::mem::take(&mut *self.inbox.lock())
    }

    /// Announces the intention to block and returns the wake word to wait on.
    /// The caller must re-check for work after this call.
    pub(crate) fn begin_park(&self) -> u32 {
        self.parked.store(true, Ordering::SeqCst);
        self.wake_word.load(Ordering::SeqCst)
    }

    pub(crate) fn end_park(&self) {
        self.parked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }

    fn unpark(&self) -> bool {
        self.wake_word.fetch_add(1, Ordering::SeqCst);

        if !self.parked.load(Ordering::SeqCst) {
            return false;
        }

        if let Err(e) = futex_wake(&self.wake_word, 1) {
            tracing::warn!("failed to wake parked worker: {}", e);
        }
        true
    }
}

/// State shared by every worker of a runtime and by its handles.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,

    shutdown: AtomicBool,

    /// Global queue for tasks spawned from outside a worker, or through
    /// `spawn_mt`, and for migratable tasks woken from a foreign thread.
    pub(crate) injector: Injector<Task>,

    /// One entry per worker, indexed by `Core::index`.
    pub(crate) remotes: Box<[Remote]>,

    /// Every task that has not completed yet.
    pub(crate) tasks: OwnedTasks,

    /// Threads running `spawn_blocking` jobs.
    pub(crate) blocking: ThreadPool,
}

impl Shared {
    pub(crate) fn new(cfg: RuntimeConfig, stealers: impl IntoIterator<Item = Stealer<Task>>) -> Self {
        let remotes = stealers.into_iter().map(Remote::new).collect::<Box<[_]>>();
        debug_assert_eq!(remotes.len(), cfg.num_workers());

        Shared {
            tasks: OwnedTasks::new(&cfg),
            blocking: ThreadPool::new(cfg.max_blocking_threads),
            cfg,
            shutdown: AtomicBool::new(false),
            injector: Injector::new(),
            remotes,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Returns `true` for the first caller only.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.remotes.len()
    }

    /// Sends a task pinned to `worker` through its inbox.
    pub(crate) fn push_remote(&self, worker: usize, task: Task) {
        self.remotes[worker].inbox.lock().push_back(task);
        self.unpark(worker);
    }

    /// Pushes a migratable task on the global queue and wakes an idle worker.
    pub(crate) fn push_injector(&self, task: Task) {
        self.injector.push(task);
        self.unpark_one();
    }

    pub(crate) fn unpark(&self, worker: usize) -> bool {
        self.remotes[worker].unpark()
    }

    /// Wakes one parked worker, if any.
    pub(crate) fn unpark_one(&self) -> bool {
        self.remotes
            .iter()
            .find(|remote| remote.is_parked())
            .is_some_and(Remote::unpark)
    }

    pub(crate) fn unpark_all(&self) -> usize {
        self.remotes.iter().filter(|remote| remote.unpark()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crossbeam_deque::Worker as CbWorker;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::time::Duration;

    assert_impl_all!(Shared: Send, Sync);
    assert_impl_all!(Remote: Send, Sync);

    fn shared(workers: usize) -> anyhow::Result<(Arc<Shared>, Vec<CbWorker<Task>>)> {
        let cfg = RuntimeConfig::try_from(Builder::new_stealing().worker_threads(workers - 1))?;
        let queues = (0..workers).map(|_| CbWorker::new_fifo()).collect::<Vec<_>>();
        let shared = Shared::new(cfg, queues.iter().map(CbWorker::stealer));
        Ok((Arc::new(shared), queues))
    }

    #[test]
    fn test_unpark_only_parked() -> anyhow::Result<()> {
        let (shared, _queues) = shared(2)?;

        assert!(!shared.unpark_one());
        assert_eq!(shared.remotes[1].wake_word.load(Ordering::SeqCst), 0);

        let seen = shared.remotes[1].begin_park();
        assert!(shared.unpark_one());
        assert_ne!(shared.remotes[1].wake_word.load(Ordering::SeqCst), seen);
        Ok(())
    }

    #[test]
    fn test_unpark_wakes_blocked_thread() -> anyhow::Result<()> {
        let (shared, _queues) = shared(2)?;

        let parked = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let remote = &shared.remotes[1];
                let seen = remote.begin_park();
                crate::reactor::futex::futex_wait(&remote.wake_word, seen, Some(Duration::from_secs(5)))?;
                remote.end_park();
                anyhow::Ok(())
            })
        };

        while !shared.remotes[1].is_parked() {
            std::thread::yield_now();
        }

        let start = std::time::Instant::now();
        shared.unpark(1);
        parked.join().expect("parked thread panicked")?;
        assert!(start.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_shutdown_once() -> anyhow::Result<()> {
        let (shared, _queues) = shared(2)?;
        assert!(shared.begin_shutdown());
        assert!(!shared.begin_shutdown());
        assert!(shared.is_shutdown());
        Ok(())
    }
}
