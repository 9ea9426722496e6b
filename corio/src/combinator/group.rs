use crate::combinator::when_all;
use crate::task::{self, JoinError, JoinHandle};
use std::fmt;

/// A set of spawned tasks awaited together.
///
/// Tasks start running as soon as they are added. [`wait`](TaskGroup::wait)
/// joins all of them and leaves the group empty, ready for the next batch.
/// Dropping the group detaches the tasks it still holds.
///
/// ```no_run
/// use corio::combinator::TaskGroup;
///
/// # #[corio::main]
/// # async fn main() {
/// let mut group = TaskGroup::new();
/// for i in 0..4u32 {
///     group.spawn(async move { i * i });
/// }
///
/// let squares = group.wait().await;
/// assert_eq!(squares.into_iter().map(Result::unwrap).sum::<u32>(), 14);
/// # }
/// ```
pub struct TaskGroup<T> {
    handles: Vec<JoinHandle<T>>,
}

impl<T> TaskGroup<T> {
    pub fn new() -> Self {
        TaskGroup {
            handles: Vec::new(),
        }
    }

    /// Adds an already spawned task.
    pub fn add(&mut self, handle: JoinHandle<T>) -> &mut Self {
        self.handles.push(handle);
        self
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Requests termination of every task in the group. Their results are
    /// still collected by [`wait`](TaskGroup::wait).
    pub fn abort_all(&self) {
        self.handles.iter().for_each(JoinHandle::abort);
    }

    /// Waits for every task, returning their results in insertion order.
    pub async fn wait(&mut self) -> Vec<task::Result<T>> {
        when_all(self.handles.drain(..)).await
    }
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Spawns `future` on the current worker, see [`spawn`](crate::spawn).
    #[track_caller]
    pub fn spawn<F>(&mut self, future: F) -> &mut Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.add(crate::spawn(future))
    }

    /// Spawns `future` through the global queue, see
    /// [`spawn_mt`](crate::spawn_mt).
    #[track_caller]
    pub fn spawn_mt<F>(&mut self, future: F) -> &mut Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.add(crate::spawn_mt(future))
    }
}

impl<T, E: From<JoinError>> TaskGroup<Result<T, E>> {
    /// Waits for every task, then returns all the values or the first error
    /// in insertion order. A task that panicked or was aborted counts as
    /// failed.
    pub async fn try_wait(&mut self) -> Result<Vec<T>, E> {
        self.wait()
            .await
            .into_iter()
            .map(|res| res.map_err(E::from).and_then(|inner| inner))
            .collect()
    }
}

impl<T> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TaskGroup<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("len", &self.len())
            .finish()
    }
}
