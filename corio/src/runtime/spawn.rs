//! Provides functions and types for spawning new tasks onto the runtime.
//!
//! Tasks can be spawned using the simple [`spawn()`] function for default
//! behavior, or configured using the [`SpawnBuilder`] for more control.
use crate::context;
use crate::task::JoinHandle;
use bitflags::bitflags;
use std::fmt::Display;

/// Spawns a new asynchronous task on the current worker.
///
/// The task is pushed at the back of the calling worker's ready queue. On the
/// stealing runtime an idle worker may pick it up before the current one gets
/// to it.
///
/// # Panics
///
/// Panics when called outside of a runtime. Use [`Handle::spawn`] from other
/// threads.
///
/// [`Handle::spawn`]: crate::runtime::Handle::spawn
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    context::with_context(|ctx| ctx.handle.spawn_with(future, None, false))
}

/// Spawns a new task through the global queue.
///
/// The first worker looking for work runs it, which spreads a burst of
/// spawns over the whole runtime instead of the calling worker.
#[track_caller]
pub fn spawn_mt<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    context::with_context(|ctx| ctx.handle.spawn_with(future, None, true))
}

/// Spawns a task whose result nobody awaits. An `Err` output is logged.
#[track_caller]
pub fn spawn_detached<F, T, E>(future: F)
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    drop(spawn(async move {
        if let Err(e) = future.await {
            tracing::error!(task.id = %crate::task::id(), "detached task failed: {}", e);
        }
    }));
}

/// Creates a new [SpawnBuilder] for configuring and spawning a task.
///
/// # Example
///
/// ```no_run
/// use corio::TaskOpts;
///
/// # #[corio::main]
/// # async fn main() {
/// let handle = corio::spawn_builder()
///     .opts(TaskOpts::STICKY)
///     .spawn(async { 1 });
///
/// assert_eq!(handle.await.unwrap(), 1);
/// # }
/// ```
pub fn spawn_builder() -> SpawnBuilder {
    SpawnBuilder::default()
}

bitflags! {
    /// Configuration options for a new task.
    ///
    /// Passed to the runtime via [SpawnBuilder::opts].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct TaskOpts: u16 {
        /// Task will stick to the worker which polls it first.
        ///
        /// This prevents the work-stealing scheduler from migrating it.
        const STICKY = 1;
    }
}

impl TaskOpts {
    pub(crate) fn is_sticky(&self) -> bool {
        self.contains(TaskOpts::STICKY)
    }
}

/// A builder for configuring and spawning a new task.
///
/// Created by calling [spawn_builder()].
#[derive(Debug, Default)]
pub struct SpawnBuilder {
    opts: Option<TaskOpts>,
}

impl SpawnBuilder {
    /// Sets the [TaskOpts] for the new task.
    pub fn opts(mut self, opts: TaskOpts) -> Self {
        self.opts = Some(opts);
        self
    }

    /// Spawns the task on the current worker.
    #[track_caller]
    pub fn spawn<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        context::with_context(|ctx| ctx.handle.spawn_with(future, self.opts, false))
    }

    /// Spawns the task through the global queue.
    #[track_caller]
    pub fn spawn_mt<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        context::with_context(|ctx| ctx.handle.spawn_with(future, self.opts, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_opts_not_sticky() {
        assert!(!TaskOpts::default().is_sticky());
        assert!(TaskOpts::STICKY.is_sticky());
    }

    #[test]
    #[should_panic(expected = "must be called from a corio runtime worker")]
    fn test_spawn_outside_runtime_panics() {
        drop(spawn(async {}));
    }
}
