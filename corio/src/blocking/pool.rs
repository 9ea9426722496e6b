use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// How long an idle thread waits for a job before exiting.
const KEEP_ALIVE: Duration = Duration::from_secs(10);

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool of OS threads running blocking jobs off the workers.
///
/// Threads are started on demand up to `max_threads`. Each thread waits on
/// its own slot for the next job: submitting hands the job straight to an
/// idle thread, or starts one, or queues it in a FIFO backlog once every
/// thread is busy.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<Inner>,
}

struct Inner {
    max_threads: usize,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Live threads, busy or idle.
    threads: usize,
    working: usize,
    next_id: usize,
    idle: Vec<Arc<Slot>>,
    backlog: VecDeque<Job>,
    handles: Vec<(Arc<Slot>, thread::JoinHandle<()>)>,
    shutdown: bool,
}

/// Handoff point between the pool and one thread.
#[derive(Default)]
struct Slot {
    job: Mutex<Option<Job>>,
    cv: Condvar,
    stop: AtomicBool,
}

impl Slot {
    fn give(&self, job: Job) {
        *self.job.lock() = Some(job);
        self.cv.notify_one();
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _job = self.job.lock();
        self.cv.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

enum Next {
    Job(Job),
    /// Idle for longer than `KEEP_ALIVE`, already removed from the pool.
    Retire,
    Stop,
}

impl ThreadPool {
    pub(crate) fn new(max_threads: usize) -> Self {
        ThreadPool {
            inner: Arc::new(Inner {
                max_threads,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let mut state = self.inner.state.lock();

        if state.shutdown {
            return Err(Error::Other(anyhow::anyhow!("blocking pool is shut down")));
        }

        if let Some(slot) = state.idle.pop() {
            state.working += 1;
            drop(state);
            slot.give(job);
            return Ok(());
        }

        if state.threads >= self.inner.max_threads {
            state.backlog.push_back(job);
            tracing::trace!(backlog = state.backlog.len(), "blocking job queued");
            return Ok(());
        }

        let id = state.next_id;
        state.next_id += 1;
        state.threads += 1;
        state.working += 1;

        let slot = Arc::new(Slot::default());
        *slot.job.lock() = Some(job);

        match self.spawn_thread(id, Arc::clone(&slot)) {
            Ok(handle) => {
                state.handles.push((slot, handle));
                Ok(())
            }
            Err(e) => {
                state.threads -= 1;
                state.working -= 1;
                tracing::warn!("failed to spawn blocking thread: {}", e);
                Err(e.into())
            }
        }
    }

    fn spawn_thread(&self, id: usize, slot: Arc<Slot>) -> io::Result<thread::JoinHandle<()>> {
        let inner = Arc::clone(&self.inner);

        thread::Builder::new()
            .name(format!("corio-blocking-{id}"))
            .spawn(move || inner.run(slot))
    }

    /// Number of live threads.
    pub fn threads_count(&self) -> usize {
        self.inner.state.lock().threads
    }

    /// Number of threads currently running a job.
    pub fn working_threads_count(&self) -> usize {
        self.inner.state.lock().working
    }

    /// Number of jobs waiting for a thread.
    pub fn backlog_len(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    /// Stops every thread. Queued jobs are dropped.
    ///
    /// Idle threads are joined. Threads still running a job are detached and
    /// exit once it returns.
    pub(crate) fn shutdown(&self) {
        let (idle, busy, backlog) = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;

            let idle = std::mem::take(&mut state.idle);
            let (idle, busy): (Vec<_>, Vec<_>) = std::mem::take(&mut state.handles)
                .into_iter()
                .partition(|(slot, _)| idle.iter().any(|s| Arc::ptr_eq(s, slot)));

            (idle, busy, std::mem::take(&mut state.backlog))
        };

        if !backlog.is_empty() {
            tracing::debug!(jobs = backlog.len(), "dropping queued blocking jobs");
        }
        drop(backlog);

        for (slot, _) in &busy {
            slot.stop();
        }
        if !busy.is_empty() {
            tracing::debug!(threads = busy.len(), "detaching busy blocking threads");
        }

        for (slot, handle) in idle {
            slot.stop();
            if handle.join().is_err() {
                tracing::error!("blocking thread panicked");
            }
        }
    }
}

impl Inner {
    fn run(&self, slot: Arc<Slot>) {
        tracing::trace!("blocking thread started");

        loop {
            let job = match self.wait_for_job(&slot) {
                Next::Job(job) => job,
                Next::Retire => break,
                Next::Stop => {
                    self.state.lock().threads -= 1;
                    break;
                }
            };

            // Jobs catch their own panics, see `spawn_blocking`.
            job();

            let mut state = self.state.lock();
            match state.backlog.pop_front() {
                Some(next) => {
                    drop(state);
                    *slot.job.lock() = Some(next);
                }
                None if state.shutdown => {
                    state.working -= 1;
                    state.threads -= 1;
                    break;
                }
                None => {
                    state.working -= 1;
                    state.idle.push(Arc::clone(&slot));
                }
            }
        }

        tracing::trace!("blocking thread exiting");
    }

    fn wait_for_job(&self, slot: &Arc<Slot>) -> Next {
        let mut job = slot.job.lock();

        loop {
            if let Some(job) = job.take() {
                return Next::Job(job);
            }

            if slot.is_stopped() {
                return Next::Stop;
            }

            if !slot.cv.wait_for(&mut job, KEEP_ALIVE).timed_out() {
                continue;
            }

            // The pool locks its state before a slot, never the reverse.
            drop(job);
            let mut state = self.state.lock();

            if let Some(pos) = state.idle.iter().position(|s| Arc::ptr_eq(s, slot)) {
                state.idle.swap_remove(pos);
                state.threads -= 1;
                state
                    .handles
                    .retain(|(s, _)| !Arc::ptr_eq(s, slot));
                tracing::trace!("blocking thread idle for {:?}, retiring", KEEP_ALIVE);
                return Next::Retire;
            }

            // Picked by `submit` while we timed out, the job is on its way.
            drop(state);
            job = slot.job.lock();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ThreadPool")
            .field("max_threads", &self.inner.max_threads)
            .field("threads", &state.threads)
            .field("working", &state.working)
            .field("backlog", &state.backlog.len())
            .finish()
    }
}
