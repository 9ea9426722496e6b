use crate::context;
use crate::runtime::{Schedule, TaskOpts};
use crate::task::error::panic_payload_as_str;
use crate::task::join::JoinState;
use crate::task::state::{TransitionToIdle, TransitionToNotified, TransitionToRunning};
use crate::task::{Header, Id, JoinError};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// Type-erased operations a worker performs on a task.
pub(crate) trait RawTask: Send + Sync + 'static {
    fn header(&self) -> &Arc<Header>;

    /// Polls the future once. Only the worker that popped the task from a
    /// ready queue calls this.
    fn run(self: Arc<Self>);

    /// Drops the future of a task no worker is polling and completes its
    /// `JoinHandle` with a cancellation error.
    fn shutdown(self: Arc<Self>);

    /// Requests the task to stop at its next scheduling point.
    fn remote_abort(self: Arc<Self>);
}

/// A reference to a spawned task, held by ready queues, wakers and the task
/// registry.
#[derive(Clone)]
pub(crate) struct Task {
    raw: Arc<dyn RawTask>,
}

impl Task {
    pub(crate) fn id(&self) -> Id {
        self.raw.header().id
    }

    pub(crate) fn header(&self) -> &Arc<Header> {
        self.raw.header()
    }

    pub(crate) fn is_stealable(&self) -> bool {
        self.header().is_stealable()
    }

    pub(crate) fn run(self) {
        self.raw.run();
    }

    pub(crate) fn shutdown(self) {
        self.raw.shutdown();
    }

    pub(crate) fn remote_abort(&self) {
        Arc::clone(&self.raw).remote_abort();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.header().state)
            .finish()
    }
}

enum Stage<F: Future> {
    Running(Pin<Box<F>>),
    Consumed,
}

/// The allocation backing a spawned future.
pub(crate) struct Cell<F: Future, S> {
    header: Arc<Header>,
    stage: Mutex<Stage<F>>,
    join: Arc<JoinState<F::Output>>,
    scheduler: S,
}

impl<F, S> Cell<F, S>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    pub(crate) fn new(
        future: F,
        opts: TaskOpts,
        scheduler: S,
        join: Arc<JoinState<F::Output>>,
    ) -> Arc<Self> {
        Arc::new(Cell {
            header: Arc::new(Header::new(Id::next(), opts)),
            stage: Mutex::new(Stage::Running(Box::pin(future))),
            join,
            scheduler,
        })
    }

    pub(crate) fn into_task(self: Arc<Self>) -> Task {
        Task { raw: self }
    }

    fn poll_future(self: &Arc<Self>) -> Option<std::thread::Result<F::Output>> {
        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let _guard = context::TaskGuard::enter(Arc::clone(&self.header));

        let mut stage = self.stage.lock();
        let Stage::Running(fut) = &mut *stage else {
            return None;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => None,
            Ok(Poll::Ready(output)) => Some(Ok(output)),
            Err(payload) => Some(Err(payload)),
        }
    }

    fn complete(&self, output: Result<F::Output, JoinError>) {
        // Drop the future before notifying the joiner, so resources it holds
        // are released by the time the `JoinHandle` resolves.
        let stage = std::mem::replace(&mut *self.stage.lock(), Stage::Consumed);
        drop(stage);

        self.header.state.transition_to_complete();
        self.scheduler.release(&self.header.id);

        if let Err(err) = &output {
            if err.is_panic() && self.join.is_detached() {
                tracing::error!(task.id = %self.header.id, "detached task failed: {}", err);
            }
        }

        self.join.complete(output);
    }
}

impl<F, S> RawTask for Cell<F, S>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    fn header(&self) -> &Arc<Header> {
        &self.header
    }

    fn run(self: Arc<Self>) {
        match self.header.state.transition_to_running() {
            TransitionToRunning::Failed => return,
            TransitionToRunning::Cancelled => {
                tracing::trace!(task.id = %self.header.id, "task aborted");
                self.complete(Err(JoinError::cancelled(self.header.id)));
                return;
            }
            TransitionToRunning::Success => {}
        }

        match self.poll_future() {
            None => {
                if let TransitionToIdle::OkNotified = self.header.state.transition_to_idle() {
                    self.scheduler.schedule(Arc::clone(&self).into_task());
                }
            }
            Some(Ok(output)) => self.complete(Ok(output)),
            Some(Err(payload)) => {
                tracing::error!(
                    task.id = %self.header.id,
                    panic = panic_payload_as_str(&*payload).unwrap_or("<non-string payload>"),
                    "task panicked"
                );
                self.complete(Err(JoinError::panic(self.header.id, payload)));
            }
        }
    }

    fn shutdown(self: Arc<Self>) {
        if self.header.state.transition_to_shutdown() {
            self.complete(Err(JoinError::cancelled(self.header.id)));
        }
    }

    fn remote_abort(self: Arc<Self>) {
        if let TransitionToNotified::Submit = self.header.state.transition_to_cancelled() {
            let task = Arc::clone(&self).into_task();
            self.scheduler.schedule(task);
        }
    }
}

impl<F, S> Wake for Cell<F, S>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let TransitionToNotified::Submit = self.header.state.transition_to_notified() {
            self.scheduler.schedule(Arc::clone(self).into_task());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::new_task;
    use crate::test_utils::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    assert_impl_all!(Task: Send, Sync, Clone);

    #[test]
    fn test_run_to_completion() {
        let (task, join) = new_task(async { 7 }, None, DummyScheduler);
        task.run();

        assert!(join.is_finished());
        assert_eq!(join.try_take_output().map(|r| r.ok()), Some(Some(7)));
    }

    #[test]
    fn test_panic_is_caught() {
        let (task, join) = new_task(
            async {
                if true {
                    panic!("boom");
                }
                1
            },
            None,
            DummyScheduler,
        );
        task.run();

        let err = join.try_take_output().and_then(|r| r.err());
        assert!(err.is_some_and(|e| e.is_panic()));
    }

    #[test]
    fn test_self_wake_requeues_once() {
        let scheduler = CountingScheduler::default();
        let polls = Arc::new(AtomicUsize::new(0));

        let fut = {
            let polls = Arc::clone(&polls);
            std::future::poll_fn(move |cx| {
                if polls.fetch_add(1, Ordering::Relaxed) == 0 {
                    // Wake twice while running: only one re-queue expected.
                    cx.waker().wake_by_ref();
                    cx.waker().wake_by_ref();
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            })
        };

        let (task, _join) = new_task(fut, None, scheduler.clone());
        task.run();

        assert_eq!(scheduler.scheduled(), 1);
        scheduler.run_all();
        assert_eq!(polls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_abort_idle_task() {
        let scheduler = CountingScheduler::default();
        let (task, join) = new_task(std::future::pending::<()>(), None, scheduler.clone());
        task.run();
        assert_eq!(scheduler.scheduled(), 0);

        join.abort();
        assert_eq!(scheduler.scheduled(), 1);
        scheduler.run_all();

        let err = join.try_take_output().and_then(|r| r.err());
        assert!(err.is_some_and(|e| e.is_cancelled()));
    }
}
