//! Spawned tasks, their handles and identifiers.
//!
//! A task is a `Send + 'static` future owned by the runtime. Waking a task
//! never polls it inline: the waker pushes it to the ready queue of the worker
//! that owns it, or to the cross-thread path when woken from elsewhere.
use crate::runtime::{Schedule, TaskOpts};

pub mod abort;
pub use self::abort::AbortHandle;

mod error;
pub use self::error::JoinError;

mod header;
pub(crate) use self::header::Header;

pub mod id;
pub use self::id::{Id, id, try_id};

mod join;
pub use self::join::{JoinHandle, join};

mod raw;
pub(crate) use self::raw::Task;

mod state;

pub use crate::time::yield_now;

/// Task result sent back.
pub type Result<T> = std::result::Result<T, JoinError>;

/// Creates a task and its `JoinHandle`. The caller is responsible for pushing
/// the task on a ready queue and registering it with the runtime.
pub(crate) fn new_task<F, S>(
    future: F,
    opts: Option<TaskOpts>,
    scheduler: S,
) -> (Task, JoinHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    let state = join::JoinState::new();
    let task = raw::Cell::new(future, opts.unwrap_or_default(), scheduler, state.clone()).into_task();
    let handle = JoinHandle::new(task.clone(), state);

    (task, handle)
}
