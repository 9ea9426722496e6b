//! Kernel asynchronous I/O driver.
//!
//! The scheduler and the cancellation machinery only talk to the [`Reactor`]
//! trait. The io_uring backend lives in [`uring`]; each worker owns exactly
//! one reactor and only that worker's thread touches it.
use crate::error::Result;
use io_uring::squeue::Entry;
use std::any::Any;
use std::sync::atomic::AtomicU32;
use std::task::{Poll, Waker};
use std::time::Duration;

pub(crate) mod futex;
pub use self::futex::Futex2Flags;

mod operation;

mod ring;

mod slab;

mod uring;
pub(crate) use self::uring::UringReactor;

/// Memory that must stay alive until the kernel is done with a request.
pub(crate) type Keepalive = Box<dyn Any + Send>;

/// Stable handle to an in-flight [`Operation`](operation::Operation) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OpHandle(usize);

impl OpHandle {
    pub(crate) fn user_data(&self) -> u64 {
        self.0 as u64
    }
}

/// Submit / poll / cancel interface the rest of the runtime relies on.
pub(crate) trait Reactor {
    /// Queues a request whose completion wakes `waker`.
    fn submit(&mut self, entry: Entry, waker: &Waker) -> Result<OpHandle>;

    /// Queues a request linked to a timeout: whichever finishes first cancels
    /// the other. The request then completes with `-ECANCELED`.
    fn submit_with_deadline(
        &mut self,
        entry: Entry,
        deadline: Duration,
        waker: &Waker,
    ) -> Result<OpHandle>;

    /// Queues a request nobody awaits. `keepalive` is released with the record.
    fn submit_detached(&mut self, entry: Entry, keepalive: Option<Keepalive>) -> Result<()>;

    /// Returns the completion result once, consuming the record. Until then the
    /// latest `waker` is stored.
    fn poll_op(&mut self, handle: OpHandle, waker: &Waker) -> Poll<Result<i32>>;

    /// Best-effort cancel of a pending request. The request may still complete
    /// with its natural result.
    fn cancel(&mut self, handle: OpHandle) -> Result<()>;

    /// The awaiting side went away: keep `keepalive` until the kernel is done
    /// and free the record on completion.
    fn orphan(&mut self, handle: OpHandle, keepalive: Option<Keepalive>);

    /// Hands queued requests to the kernel without waiting.
    fn flush(&mut self) -> Result<usize>;

    /// Non-blocking: collects completions the kernel already has.
    fn poll_completions(&mut self, woken: &mut Vec<Waker>) -> Result<usize>;

    /// Blocks until at least one completion arrives or `timeout` elapses.
    fn wait(&mut self, timeout: Option<Duration>, woken: &mut Vec<Waker>) -> Result<usize>;

    /// Arms a wait on `word` so a foreign thread can interrupt [`Reactor::wait`]
    /// with [`futex::futex_wake`]. Returns `false` when the kernel cannot.
    fn arm_wakeup(&mut self, word: &AtomicU32, seen: u32) -> Result<bool>;

    /// True when completions are ready to be reaped.
    fn has_ready(&mut self) -> bool;

    fn num_unsubmitted(&mut self) -> usize;

    /// Number of records still owned by the kernel, including detached ones.
    fn in_flight(&self) -> usize;

    /// Cancels everything in flight and waits up to `timeout` for the kernel to
    /// give the memory back.
    fn shutdown(&mut self, timeout: Duration);
}
