use crate::cancel::source::RegistrationId;
use crate::cancel::{CancelAdaptor, CancelToken};
use crate::error::{Error, Result};
use pin_project::{pin_project, pinned_drop};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    Idle,
    Running(RegistrationId),
    Canceling(RegistrationId),
    Done,
}

/// Runs a [`CancelAdaptor`] under a cancellation scope.
///
/// Created by [`CancelToken::guard`]. The registration is removed when the
/// operation completes or when the guard is dropped, whichever comes first.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Guarded<A: CancelAdaptor> {
    #[pin]
    op: A,
    token: CancelToken,
    state: GuardState,
}

impl<A: CancelAdaptor> Guarded<A> {
    pub(crate) fn new(op: A, token: CancelToken) -> Self {
        Guarded {
            op,
            token,
            state: GuardState::Idle,
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// The wrapped operation.
    pub fn get_ref(&self) -> &A {
        &self.op
    }
}

impl<A: CancelAdaptor> Future for Guarded<A> {
    type Output = A::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let scope = &this.token.scope;

        match *this.state {
            GuardState::Idle => {
                let Some(id) = scope.register(cx.waker()) else {
                    *this.state = GuardState::Done;
                    return Poll::Ready(this.op.early_canceled());
                };

                // Close the race with a `cancel` that ran between the flag
                // check and the insertion.
                if scope.is_canceled() {
                    scope.deregister(id);
                    *this.state = GuardState::Done;
                    return Poll::Ready(this.op.early_canceled());
                }

                *this.state = GuardState::Running(id);
            }
            GuardState::Running(id) | GuardState::Canceling(id) => scope.update_waker(id, cx.waker()),
            GuardState::Done => panic!("`Guarded` polled after completion"),
        }

        if let GuardState::Running(id) = *this.state
            && scope.is_canceled()
        {
            *this.state = GuardState::Canceling(id);
        }

        let (id, res) = match *this.state {
            GuardState::Running(id) => (id, this.op.as_mut().poll_run(cx)),
            GuardState::Canceling(id) => (id, this.op.as_mut().poll_cancel(cx)),
            _ => unreachable!(),
        };

        if res.is_ready() {
            scope.deregister(id);
            *this.state = GuardState::Done;
        }

        res
    }
}

#[pinned_drop]
impl<A: CancelAdaptor> PinnedDrop for Guarded<A> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();

        if let GuardState::Running(id) | GuardState::Canceling(id) = *this.state {
            this.token.scope.deregister(id);
        }
    }
}

impl<A: CancelAdaptor> fmt::Debug for Guarded<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guarded")
            .field("state", &self.state)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Indefinite wait that only ends when its scope is canceled.
#[derive(Debug, Default)]
pub struct Cancelled {
    _p: (),
}

impl CancelAdaptor for Cancelled {
    type Output = ();

    fn poll_run(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // The guard registered our waker with the scope.
        Poll::Pending
    }

    fn poll_cancel(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        Poll::Ready(())
    }

    fn early_canceled(self: Pin<&mut Self>) {}
}

/// Wraps an arbitrary future so that canceling the scope drops it.
///
/// Created by [`CancelToken::abortable`].
pub struct Abortable<F> {
    future: Option<Pin<Box<F>>>,
}

impl<F: Future> CancelAdaptor for Abortable<F> {
    type Output = Result<F::Output>;

    fn poll_run(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.future.as_mut() {
            Some(future) => future.as_mut().poll(cx).map(Ok),
            None => Poll::Ready(Err(Error::Canceled)),
        }
    }

    fn poll_cancel(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future = None;
        Poll::Ready(Err(Error::Canceled))
    }

    fn early_canceled(mut self: Pin<&mut Self>) -> Self::Output {
        self.future = None;
        Err(Error::Canceled)
    }
}

impl<F> fmt::Debug for Abortable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Abortable")
            .field("dropped", &self.future.is_none())
            .finish()
    }
}

impl CancelToken {
    /// Waits until the scope is canceled.
    pub fn cancelled(&self) -> Guarded<Cancelled> {
        self.guard(Cancelled::default())
    }

    /// Runs `future` until it completes or the scope is canceled, in which
    /// case the future is dropped and [`Error::Canceled`] is returned.
    pub fn abortable<F: Future>(&self, future: F) -> Guarded<Abortable<F>> {
        self.guard(Abortable {
            future: Some(Box::pin(future)),
        })
    }
}
