use crate::context;
use crate::task::{Id, JoinError, Result, Task};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

/// Output slot shared between a task and its `JoinHandle`.
pub(crate) struct JoinState<T> {
    output: Mutex<Option<Result<T>>>,
    waker: AtomicWaker,
    complete: AtomicBool,
    detached: AtomicBool,
}

impl<T> JoinState<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(JoinState {
            output: Mutex::new(None),
            waker: AtomicWaker::new(),
            complete: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        })
    }

    pub(crate) fn complete(&self, output: Result<T>) {
        *self.output.lock() = Some(output);
        self.complete.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// An owned permission to join on a task (await its termination).
///
/// This can be thought of as the equivalent of [`std::thread::JoinHandle`]
/// for a corio task rather than a thread. The task associated with this
/// `JoinHandle` started running as soon as it was spawned, even if the handle
/// was never awaited.
///
/// A `JoinHandle` *detaches* the associated task when it is dropped: the task
/// keeps running in the background and its return value is lost.
///
/// ```no_run
/// # #[corio::main(flavor = "local")]
/// # async fn main() -> anyhow::Result<()> {
/// let handle = corio::spawn(async { 5 + 3 });
/// assert_eq!(handle.await?, 8);
/// # Ok(())
/// # }
/// ```
///
/// Panics inside the task are caught and returned as a [`JoinError`]:
///
/// ```no_run
/// # #[corio::main(flavor = "local")]
/// # async fn main() {
/// let handle = corio::spawn(async {
///     if true {
///         panic!("boom");
///     }
/// });
///
/// assert!(handle.await.unwrap_err().is_panic());
/// # }
/// ```
pub struct JoinHandle<T> {
    task: Task,
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: Task, state: Arc<JoinState<T>>) -> JoinHandle<T> {
        JoinHandle { task, state }
    }

    /// Abort the task associated with the handle.
    ///
    /// The future is dropped on its worker the next time it would have been
    /// polled. Awaiting an aborted task resolves with a [cancelled] error,
    /// unless it completed before the request was observed.
    ///
    /// [cancelled]: method@JoinError::is_cancelled
    pub fn abort(&self) {
        self.task.remote_abort();
    }

    /// Returns a new `AbortHandle` that can be used to remotely abort this task.
    #[must_use = "abort handles do nothing unless `.abort` is called"]
    pub fn abort_handle(&self) -> super::AbortHandle {
        super::AbortHandle::new(self.task.clone())
    }

    /// Checks if the task associated with this `JoinHandle` has finished.
    pub fn is_finished(&self) -> bool {
        self.state.is_complete()
    }

    /// Returns a [task ID] that uniquely identifies this task.
    ///
    /// [task ID]: crate::task::Id
    pub fn id(&self) -> Id {
        self.task.id()
    }

    /// Blocks the current thread until the task completes.
    ///
    /// This is the bridge for synchronous code running *outside* the runtime,
    /// such as a plain `std::thread` or the `main` function before entering
    /// `block_on`.
    ///
    /// # Panics
    ///
    /// Panics if called from a runtime worker: the worker would stop driving
    /// the very tasks it is waiting on.
    #[track_caller]
    pub fn join(self) -> Result<T> {
        assert!(
            !context::is_worker_thread(),
            "`JoinHandle::join` cannot be called from a runtime worker, `.await` the handle instead"
        );

        futures::executor::block_on(self)
    }

    pub(crate) fn try_take_output(&self) -> Option<Result<T>> {
        if self.state.is_complete() {
            self.state.output.lock().take()
        } else {
            None
        }
    }
}

impl<T> Unpin for JoinHandle<T> {}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Register first so a completion racing with this poll still wakes us.
        self.state.waker.register(cx.waker());

        if !self.state.is_complete() {
            return Poll::Pending;
        }

        match self.state.output.lock().take() {
            Some(output) => Poll::Ready(output),
            None => panic!("`JoinHandle` polled after its output was taken"),
        }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        self.state.detached.store(true, Ordering::Release);
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("JoinHandle")
            .field("id", &self.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Blocks the current (non-worker) thread until `handle` completes.
///
/// Equivalent to [`JoinHandle::join`].
#[track_caller]
pub fn join<T>(handle: JoinHandle<T>) -> Result<T> {
    handle.join()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::new_task;
    use crate::test_utils::*;
    use static_assertions::assert_impl_all;
    use std::thread;

    assert_impl_all!(JoinHandle<u32>: Send, Sync, Unpin);

    #[test]
    fn test_join_from_foreign_thread() {
        let (task, join) = new_task(async { 42 }, None, DummyScheduler);

        let waiter = thread::spawn(move || join.join());
        task.run();

        assert!(matches!(waiter.join().map(|r| r.ok()), Ok(Some(42))));
    }

    #[test]
    fn test_poll_registers_waker() {
        let scheduler = CountingScheduler::default();
        let (task, mut join) = new_task(async { 1 }, None, scheduler);
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut join).poll(&mut cx).is_pending());
        task.run();

        assert_eq!(data.get_count(), 1);
        assert!(matches!(Pin::new(&mut join).poll(&mut cx), Poll::Ready(Ok(1))));
    }
}
