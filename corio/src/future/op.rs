use crate::cancel::CancelAdaptor;
use crate::context;
use crate::error::{Error, OpcodeError, Result};
use crate::reactor::{Keepalive, OpHandle};
use crate::task::Header;
use io_uring::squeue::Entry;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// A kernel request: how to build it and how to read its result.
///
/// Implementors own every buffer the kernel reads or writes. The payload does
/// not move once the request is submitted.
pub trait OpPayload: Send + 'static {
    type Output;

    /// Builds the submission entry. Called once, right before submission.
    fn create_entry(&mut self) -> Result<Entry, OpcodeError>;

    /// Converts the completion result. `-ECANCELED` is handled by [`Op`]
    /// and never reaches this method.
    fn into_output(self, res: i32) -> Result<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    Idle,
    Submitted { handle: OpHandle, worker: usize },
    Done,
}

/// Future of a single kernel request.
///
/// The request is submitted on first poll, on the worker that polls it. Until
/// it completes, the task that awaits it is pinned to that worker.
///
/// Dropping a pending `Op` issues a best-effort cancel and leaves the payload
/// with the reactor until the kernel completion arrives.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Op<T: OpPayload> {
    payload: Option<Box<T>>,
    state: OpState,
    deadline: Option<Duration>,
    cancel_requested: bool,

    /// Task charged with an in-flight operation while submitted.
    task: Option<Arc<Header>>,
}

impl<T: OpPayload> Op<T> {
    pub fn new(payload: T) -> Self {
        Op {
            payload: Some(Box::new(payload)),
            state: OpState::Idle,
            deadline: None,
            cancel_requested: false,
            task: None,
        }
    }

    /// Fails the request with [`Error::DeadlineExceeded`] if it is still
    /// pending after `deadline`. The timeout is linked in the kernel.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn submit(&mut self, cx: &mut Context<'_>) -> Poll<Result<T::Output>> {
        let Some(payload) = self.payload.as_mut() else {
            panic!("`Op` polled after completion");
        };

        let entry = match payload.create_entry() {
            Ok(entry) => entry,
            Err(e) => {
                self.state = OpState::Done;
                return Poll::Ready(Err(e.into()));
            }
        };

        let deadline = self.deadline;
        let res = context::with_context(|ctx| {
            let mut reactor = ctx.core.reactor.borrow_mut();
            let handle = match deadline {
                Some(deadline) => reactor.submit_with_deadline(entry, deadline, cx.waker()),
                None => reactor.submit(entry, cx.waker()),
            };

            match handle {
                Err(e) if e.is_retryable() => {
                    // Give the kernel what is queued, and the worker a chance
                    // to reap completions before we try again.
                    if let Err(flush_err) = reactor.flush() {
                        tracing::trace!("flush under back-pressure failed: {}", flush_err);
                    }
                    Err(e)
                }
                res => res.map(|handle| (handle, ctx.core.index)),
            }
        });

        match res {
            Ok((handle, worker)) => {
                self.task = context::current_header();
                if let Some(task) = &self.task {
                    task.increment_pending_ops();
                }

                self.state = OpState::Submitted { handle, worker };
                Poll::Pending
            }
            Err(e) if e.is_retryable() => {
                tracing::trace!("submission back-pressure: {}", e);
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(e) => {
                self.state = OpState::Done;
                Poll::Ready(Err(e))
            }
        }
    }

    fn complete(&mut self, res: i32) -> Result<T::Output> {
        self.release_task();
        self.state = OpState::Done;

        let Some(payload) = self.payload.take() else {
            return Err(Error::SlabInvalidState);
        };

        if res == -libc::ECANCELED {
            return Err(if self.cancel_requested {
                Error::Canceled
            } else if self.deadline.is_some() {
                Error::DeadlineExceeded
            } else {
                Error::from_errno(res)
            });
        }

        (*payload).into_output(res)
    }

    fn release_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.decrement_pending_ops();
        }
    }
}

impl<T: OpPayload> Future for Op<T> {
    type Output = Result<T::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.state {
            OpState::Idle => this.submit(cx),
            OpState::Submitted { handle, worker } => {
                debug_assert_eq!(
                    context::current_worker(),
                    Some(worker),
                    "operation polled away from the worker that submitted it"
                );

                match context::with_reactor(|reactor| reactor.poll_op(handle, cx.waker())) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Ok(res)) => Poll::Ready(this.complete(res)),
                    Poll::Ready(Err(e)) => {
                        this.release_task();
                        this.state = OpState::Done;
                        Poll::Ready(Err(e))
                    }
                }
            }
            OpState::Done => panic!("`Op` polled after completion"),
        }
    }
}

impl<T: OpPayload> CancelAdaptor for Op<T> {
    type Output = Result<T::Output>;

    fn poll_run(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll(cx)
    }

    fn poll_cancel(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.state {
            OpState::Idle => {
                this.state = OpState::Done;
                Poll::Ready(Err(Error::Canceled))
            }
            OpState::Submitted { handle, .. } if !this.cancel_requested => {
                this.cancel_requested = true;

                if let Err(e) = context::with_reactor(|reactor| reactor.cancel(handle)) {
                    tracing::warn!(user_data = handle.user_data(), "failed to cancel operation: {}", e);
                }

                // The request completes with either its natural result or
                // `-ECANCELED`.
                Pin::new(this).poll(cx)
            }
            _ => Pin::new(this).poll(cx),
        }
    }

    fn early_canceled(self: Pin<&mut Self>) -> Self::Output {
        self.get_mut().state = OpState::Done;
        Err(Error::Canceled)
    }
}

impl<T: OpPayload> Drop for Op<T> {
    fn drop(&mut self) {
        let OpState::Submitted { handle, worker } = self.state else {
            return;
        };

        self.release_task();

        let mut keepalive = self.payload.take().map(|payload| payload as Keepalive);

        context::try_with_context(|ctx| {
            if ctx.core.index != worker {
                return;
            }

            if let Ok(mut reactor) = ctx.core.reactor.try_borrow_mut() {
                if let Err(e) = reactor.cancel(handle) {
                    tracing::debug!(user_data = handle.user_data(), "failed to cancel orphaned operation: {}", e);
                }
                reactor.orphan(handle, keepalive.take());
            }
        });

        // Without the reactor we cannot know when the kernel is done.
        if let Some(keepalive) = keepalive {
            tracing::warn!(
                user_data = handle.user_data(),
                "operation dropped away from its worker, leaking its buffers"
            );
            std::mem::forget(keepalive);
        }
    }
}

impl<T: OpPayload> fmt::Debug for Op<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("payload", &std::any::type_name::<T>())
            .field("state", &self.state)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corio;
    use crate::cancel::CancelSource;
    use crate::future::{Nop, Timeout};
    use crate::test_utils::*;
    use anyhow::Result;
    use std::time::Instant;

    #[corio::test]
    async fn test_nop() -> Result<()> {
        Op::new(Nop).await?;
        Ok(())
    }

    #[test]
    fn test_back_pressure_retries_until_submitted() -> Result<()> {
        // Four operation slots for 64 concurrent timers.
        let rt = crate::runtime::Builder::new_local()
            .sq_ring_size(4)
            .cq_ring_size_multiplier(1)
            .try_build()?;

        let results = rt.block_on(crate::combinator::when_all(
            (0..64).map(|_| Op::new(Timeout::new(Duration::from_millis(1)))),
        ));

        assert_eq!(results.len(), 64);
        for res in results {
            res?;
        }
        Ok(())
    }

    #[corio::test]
    async fn test_deadline_exceeded() -> Result<()> {
        let start = Instant::now();
        let res = Op::new(Timeout::new(Duration::from_secs(10)))
            .deadline(Duration::from_millis(5))
            .await;

        assert!(matches!(res, Err(Error::DeadlineExceeded)), "got {:?}", res);
        assert!(start.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[corio::test]
    async fn test_deadline_not_reached() -> Result<()> {
        Op::new(Timeout::new(Duration::from_millis(1)))
            .deadline(Duration::from_secs(10))
            .await?;
        Ok(())
    }

    #[corio::test]
    async fn test_pending_op_pins_task() -> Result<()> {
        let handle = corio::spawn(async {
            let mut op = Op::new(Timeout::new(Duration::from_millis(20)));
            let (waker, _) = mock_waker();
            let mut cx = Context::from_waker(&waker);

            assert!(Pin::new(&mut op).poll(&mut cx).is_pending());
            let header = context::current_header().expect("running in a task");
            assert_eq!(header.pending_ops(), 1);
            assert!(!header.is_stealable());

            drop(op);
            assert_eq!(header.pending_ops(), 0);
        });

        handle.await?;
        Ok(())
    }

    #[corio::test]
    async fn test_dropped_op_is_orphaned() -> Result<()> {
        let mut op = Op::new(Timeout::new(Duration::from_secs(10)));
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut op).poll(&mut cx).is_pending());
        assert_eq!(context::with_reactor(|r| r.in_flight()), 1);

        drop(op);

        // The cancel completes the orphaned record, which is then released.
        let start = Instant::now();
        while context::with_reactor(|r| r.in_flight()) > 0 {
            assert!(start.elapsed() < Duration::from_secs(1), "record never released");
            corio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(data.get_count(), 0);
        Ok(())
    }

    #[corio::test]
    async fn test_guarded_op_cancel() -> Result<()> {
        let source = CancelSource::new();
        let token = source.token();

        let handle = corio::spawn(async move {
            token
                .guard(Op::new(Timeout::new(Duration::from_secs(10))))
                .await
        });

        while source.num_registered() == 0 {
            corio::time::yield_now().await;
        }

        source.cancel().await;
        assert!(matches!(handle.await?, Err(Error::Canceled)));
        Ok(())
    }
}
