use crate::runtime::TaskOpts;
use crate::task::Id;
use crate::task::state::State;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const NO_OWNER: usize = usize::MAX;

/// Hot, thread-safe part of a task.
///
/// The header lives in its own allocation so in-flight operations can hold a
/// reference to it without keeping the future alive.
#[derive(Debug)]
pub(crate) struct Header {
    pub(crate) id: Id,

    /// Task state.
    pub(crate) state: State,

    /// Index of the worker that polled the task last.
    owner: AtomicUsize,

    /// We keep track of every operation submitted on the owner's ring as a
    /// signal to determine if a task can be stolen. Completions are delivered
    /// to the ring that registered the submission.
    pending_ops: AtomicU32,

    /// Special task options to modify scheduling behaviour.
    pub(crate) opts: TaskOpts,
}

impl Header {
    pub(crate) fn new(id: Id, opts: TaskOpts) -> Header {
        Header {
            id,
            state: State::new(),
            owner: AtomicUsize::new(NO_OWNER),
            pending_ops: AtomicU32::new(0),
            opts,
        }
    }

    pub(crate) fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            idx => Some(idx),
        }
    }

    pub(crate) fn set_owner(&self, worker: usize) {
        self.owner.store(worker, Ordering::Release);
    }

    pub(crate) fn pending_ops(&self) -> u32 {
        self.pending_ops.load(Ordering::Acquire)
    }

    pub(crate) fn increment_pending_ops(&self) {
        self.pending_ops.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_pending_ops(&self) {
        let prev = self.pending_ops.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pending_ops underflow on task {}", self.id);
    }

    /// A task can migrate only if nothing is in flight on its owner's ring.
    pub(crate) fn is_stealable(&self) -> bool {
        !self.opts.is_sticky() && self.pending_ops() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Header: Send, Sync);

    #[rstest]
    #[case::default(TaskOpts::empty(), 0, true)]
    #[case::pending_io(TaskOpts::empty(), 2, false)]
    #[case::sticky(TaskOpts::STICKY, 0, false)]
    fn test_is_stealable(#[case] opts: TaskOpts, #[case] pending: u32, #[case] expected: bool) {
        let header = Header::new(Id::next(), opts);
        (0..pending).for_each(|_| header.increment_pending_ops());

        assert_eq!(header.is_stealable(), expected);
        assert_eq!(header.owner(), None);

        header.set_owner(3);
        assert_eq!(header.owner(), Some(3));
    }
}
