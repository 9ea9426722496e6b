use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

/// The task sits in a ready queue (or is about to be pushed in one).
const SCHEDULED: usize = 1;

/// A worker is polling the future.
const RUNNING: usize = 1 << 1;

/// Woken while running, must be re-queued once the poll returns.
const NOTIFIED: usize = 1 << 2;

/// The future completed, panicked or was aborted. Terminal.
const COMPLETE: usize = 1 << 3;

/// Abort was requested through a `JoinHandle` or `AbortHandle`.
const CANCELLED: usize = 1 << 4;

/// Lifecycle bits of a task.
///
/// Only the holder of the `RUNNING` bit may touch the future. A task is pushed
/// to a ready queue by whoever flips it from idle to `SCHEDULED`, which makes
/// every wake idempotent: a task is never present twice in the ready queues.
pub(crate) struct State {
    val: AtomicUsize,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Snapshot(usize);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransitionToNotified {
    DoNothing,
    Submit,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransitionToRunning {
    Success,
    Cancelled,
    Failed,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransitionToIdle {
    Ok,
    OkNotified,
}

impl State {
    /// New tasks are created scheduled as the spawner pushes them right away.
    pub(crate) fn new() -> State {
        State {
            val: AtomicUsize::new(SCHEDULED),
        }
    }

    pub(crate) fn load(&self) -> Snapshot {
        Snapshot(self.val.load(Acquire))
    }

    fn fetch_update_action<F, T>(&self, mut f: F) -> T
    where
        F: FnMut(Snapshot) -> (T, Option<Snapshot>),
    {
        let mut curr = self.load();

        loop {
            let (output, next) = f(curr);
            let Some(next) = next else {
                return output;
            };

            match self.val.compare_exchange(curr.0, next.0, AcqRel, Acquire) {
                Ok(_) => return output,
                Err(actual) => curr = Snapshot(actual),
            }
        }
    }

    /// Called by wakers.
    pub(crate) fn transition_to_notified(&self) -> TransitionToNotified {
        self.fetch_update_action(|curr| {
            if curr.is_complete() || curr.is_scheduled() {
                (TransitionToNotified::DoNothing, None)
            } else if curr.is_running() {
                if curr.is_notified() {
                    (TransitionToNotified::DoNothing, None)
                } else {
                    (
                        TransitionToNotified::DoNothing,
                        Some(curr.with(NOTIFIED)),
                    )
                }
            } else {
                (TransitionToNotified::Submit, Some(curr.with(SCHEDULED)))
            }
        })
    }

    /// Called by the worker that popped the task from a ready queue.
    pub(crate) fn transition_to_running(&self) -> TransitionToRunning {
        self.fetch_update_action(|curr| {
            if curr.is_complete() || curr.is_running() || !curr.is_scheduled() {
                return (TransitionToRunning::Failed, None);
            }

            let next = curr.without(SCHEDULED | NOTIFIED).with(RUNNING);
            if curr.is_cancelled() {
                (TransitionToRunning::Cancelled, Some(next))
            } else {
                (TransitionToRunning::Success, Some(next))
            }
        })
    }

    /// Called after a poll returned `Pending`.
    pub(crate) fn transition_to_idle(&self) -> TransitionToIdle {
        self.fetch_update_action(|curr| {
            debug_assert!(curr.is_running(), "task must be running to become idle");

            if curr.is_notified() || curr.is_cancelled() {
                let next = curr.without(RUNNING | NOTIFIED).with(SCHEDULED);
                (TransitionToIdle::OkNotified, Some(next))
            } else {
                (TransitionToIdle::Ok, Some(curr.without(RUNNING)))
            }
        })
    }

    pub(crate) fn transition_to_complete(&self) {
        self.fetch_update_action(|curr| {
            ((), Some(curr.without(RUNNING | SCHEDULED | NOTIFIED).with(COMPLETE)))
        })
    }

    /// Flags the task as cancelled. Returns `Submit` when the task was idle and
    /// must be pushed to a ready queue so a worker observes the request.
    pub(crate) fn transition_to_cancelled(&self) -> TransitionToNotified {
        self.fetch_update_action(|curr| {
            if curr.is_complete() || curr.is_cancelled() {
                (TransitionToNotified::DoNothing, None)
            } else if curr.is_running() {
                (
                    TransitionToNotified::DoNothing,
                    Some(curr.with(CANCELLED | NOTIFIED)),
                )
            } else if curr.is_scheduled() {
                (TransitionToNotified::DoNothing, Some(curr.with(CANCELLED)))
            } else {
                (
                    TransitionToNotified::Submit,
                    Some(curr.with(CANCELLED | SCHEDULED)),
                )
            }
        })
    }

    /// Claims a task that no worker is polling so it can be torn down from the
    /// current thread. Used during runtime shutdown.
    pub(crate) fn transition_to_shutdown(&self) -> bool {
        self.fetch_update_action(|curr| {
            if curr.is_complete() || curr.is_running() {
                (false, None)
            } else {
                (
                    true,
                    Some(curr.without(SCHEDULED | NOTIFIED).with(RUNNING | CANCELLED)),
                )
            }
        })
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl Snapshot {
    fn with(self, bits: usize) -> Snapshot {
        Snapshot(self.0 | bits)
    }

    fn without(self, bits: usize) -> Snapshot {
        Snapshot(self.0 & !bits)
    }

    pub(crate) fn is_scheduled(self) -> bool {
        self.0 & SCHEDULED == SCHEDULED
    }

    pub(crate) fn is_running(self) -> bool {
        self.0 & RUNNING == RUNNING
    }

    pub(crate) fn is_notified(self) -> bool {
        self.0 & NOTIFIED == NOTIFIED
    }

    pub(crate) fn is_complete(self) -> bool {
        self.0 & COMPLETE == COMPLETE
    }

    pub(crate) fn is_cancelled(self) -> bool {
        self.0 & CANCELLED == CANCELLED
    }
}

impl fmt::Debug for State {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(fmt)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Snapshot")
            .field("is_scheduled", &self.is_scheduled())
            .field("is_running", &self.is_running())
            .field("is_notified", &self.is_notified())
            .field("is_complete", &self.is_complete())
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle() -> State {
        let state = State::new();
        assert_eq!(state.transition_to_running(), TransitionToRunning::Success);
        assert_eq!(state.transition_to_idle(), TransitionToIdle::Ok);
        state
    }

    #[test]
    fn test_wake_is_idempotent() {
        let state = idle();

        assert_eq!(state.transition_to_notified(), TransitionToNotified::Submit);
        assert_eq!(
            state.transition_to_notified(),
            TransitionToNotified::DoNothing
        );
        assert!(state.load().is_scheduled());
    }

    #[test]
    fn test_wake_while_running_requeues() {
        let state = State::new();
        assert_eq!(state.transition_to_running(), TransitionToRunning::Success);

        assert_eq!(
            state.transition_to_notified(),
            TransitionToNotified::DoNothing
        );
        assert_eq!(state.transition_to_idle(), TransitionToIdle::OkNotified);
        assert!(state.load().is_scheduled());
    }

    #[test]
    fn test_cancel_idle_task_submits() {
        let state = idle();

        assert_eq!(state.transition_to_cancelled(), TransitionToNotified::Submit);
        assert_eq!(state.transition_to_running(), TransitionToRunning::Cancelled);
    }

    #[test]
    fn test_complete_is_terminal() {
        let state = State::new();
        assert_eq!(state.transition_to_running(), TransitionToRunning::Success);
        state.transition_to_complete();

        assert_eq!(
            state.transition_to_notified(),
            TransitionToNotified::DoNothing
        );
        assert_eq!(
            state.transition_to_cancelled(),
            TransitionToNotified::DoNothing
        );
        assert_eq!(state.transition_to_running(), TransitionToRunning::Failed);
        assert!(!state.transition_to_shutdown());
    }
}
