use crate::task::{Id, Task};
use std::fmt;

/// An owned permission to abort a spawned task, without awaiting its completion.
///
/// Unlike a [`JoinHandle`], an `AbortHandle` does *not* represent the
/// permission to await the task's completion, only to terminate it. Dropping
/// an `AbortHandle` does *not* abort the task.
///
/// [`JoinHandle`]: crate::task::JoinHandle
#[derive(Clone)]
pub struct AbortHandle {
    task: Task,
}

impl AbortHandle {
    pub(super) fn new(task: Task) -> Self {
        Self { task }
    }

    /// Abort the task associated with the handle.
    ///
    /// If the task was already aborted or completed, this does nothing.
    pub fn abort(&self) {
        self.task.remote_abort();
    }

    /// Checks if the task associated with this `AbortHandle` has finished.
    pub fn is_finished(&self) -> bool {
        self.task.header().state.load().is_complete()
    }

    /// Returns a [task ID] that uniquely identifies this task.
    ///
    /// [task ID]: crate::task::Id
    pub fn id(&self) -> Id {
        self.task.id()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AbortHandle")
            .field("id", &self.id())
            .finish()
    }
}
