use crate::blocking::pool::{Job, ThreadPool};
use crate::cancel::CancelAdaptor;
use crate::context;
use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::sync::oneshot::{self, FutureToken};
use crate::task::Header;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use std::thread;

/// Cooperative stop request handed to cancellable blocking jobs.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Future resolving to the output of a blocking job.
///
/// Resolves to [`Error::Closed`] if the runtime shut down before the job ran.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct BlockingHandle<T> {
    output: FutureToken<thread::Result<T>>,
    stop: StopFlag,

    /// Job held back until the first poll.
    deferred: Option<(ThreadPool, Job)>,

    /// Set once a cancellation reached the handle.
    canceling: bool,

    /// Task awaiting the job, held on its worker until the job returns.
    task: Option<Arc<Header>>,
}

/// Submits `f` to the pool right away.
pub(crate) fn spawn_on<F, T>(handle: &Handle, f: F) -> BlockingHandle<T>
where
    F: FnOnce(StopFlag) -> T + Send + 'static,
    T: Send + 'static,
{
    let mut blocking = spawn_deferred(handle, f);
    blocking.submit();
    blocking
}

/// Submits `f` to the pool on the first poll of the returned handle. A handle
/// dropped or canceled before that never runs `f`.
pub(crate) fn spawn_deferred<F, T>(handle: &Handle, f: F) -> BlockingHandle<T>
where
    F: FnOnce(StopFlag) -> T + Send + 'static,
    T: Send + 'static,
{
    let (source, output) = oneshot::channel();
    let stop = StopFlag::default();

    let job: Job = {
        let stop = stop.clone();
        Box::new(move || {
            let res = panic::catch_unwind(AssertUnwindSafe(|| f(stop)));
            source.set_value(res);
        })
    };

    BlockingHandle {
        output,
        stop,
        deferred: Some((handle.shared.blocking.clone(), job)),
        canceling: false,
        task: None,
    }
}

impl<T> BlockingHandle<T> {
    /// Raises the job's [`StopFlag`].
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.output.is_ready()
    }

    fn submit(&mut self) {
        if let Some((pool, job)) = self.deferred.take() {
            // A rejected job is dropped with its source, the handle sees `Closed`.
            if let Err(e) = pool.submit(job) {
                tracing::debug!("blocking job rejected: {}", e);
            }
        }
    }

    fn pin_task(&mut self) {
        if self.task.is_some() {
            return;
        }

        self.task = context::current_header();
        if let Some(task) = &self.task {
            task.increment_pending_ops();
        }
    }

    fn unpin_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.decrement_pending_ops();
        }
    }
}

impl<T> Future for BlockingHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.submit();
        this.pin_task();

        let res = ready!(Pin::new(&mut this.output).poll(cx));
        this.unpin_task();

        match res {
            Ok(Ok(value)) => Poll::Ready(Ok(value)),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl<T> CancelAdaptor for BlockingHandle<T> {
    type Output = Result<T>;

    fn poll_run(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll(cx)
    }

    /// Raises the flag, then waits for the job to return. A job that had
    /// already returned keeps its output.
    fn poll_cancel(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.canceling {
            self.canceling = true;

            if self.deferred.take().is_some() {
                return Poll::Ready(Err(Error::Canceled));
            }

            if self.is_finished() {
                return self.poll(cx);
            }

            self.stop();
        }

        ready!(self.poll(cx))?;
        Poll::Ready(Err(Error::Canceled))
    }

    fn early_canceled(mut self: Pin<&mut Self>) -> Self::Output {
        self.canceling = true;
        self.deferred = None;
        self.stop();
        Err(Error::Canceled)
    }
}

impl<T> Drop for BlockingHandle<T> {
    fn drop(&mut self) {
        self.unpin_task();
    }
}

impl<T> fmt::Debug for BlockingHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingHandle")
            .field("finished", &self.is_finished())
            .field("stopped", &self.stop.is_stopped())
            .finish()
    }
}
