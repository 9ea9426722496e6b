use crate::cancel::{CancelSource, CancelToken};
use crate::error::{Error, Result};
use crate::time::{Sleep, sleep, sleep_until};
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Requires `future` to complete within `duration`.
///
/// On expiry `future` is dropped and [`Error::DeadlineExceeded`] is returned.
/// A future that is ready on the same poll as the deadline wins.
///
/// ```no_run
/// # use corio::combinator::timeout;
/// # use std::time::Duration;
/// # #[corio::main]
/// # async fn main() {
/// let res = timeout(Duration::from_millis(10), corio::time::sleep(Duration::from_secs(1))).await;
/// assert!(res.unwrap_err().is_deadline_exceeded());
/// # }
/// ```
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    Timeout {
        future,
        sleep: sleep(duration),
    }
}

/// Requires `future` to complete before `deadline`.
pub fn timeout_at<F: Future>(deadline: Instant, future: F) -> Timeout<F> {
    Timeout {
        future,
        sleep: sleep_until(deadline),
    }
}

/// Runs the future built by `f` with a token that is canceled once
/// `duration` elapses.
///
/// On expiry the token is canceled and the future is driven until it
/// returns, so guarded operations inside it acknowledge the cancellation
/// before this returns [`Error::DeadlineExceeded`]. Its output is discarded.
pub async fn timeout_with<F, Fut>(duration: Duration, f: F) -> Result<Fut::Output>
where
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future,
{
    let source = CancelSource::new();
    let mut future = std::pin::pin!(f(source.token()));

    match timeout(duration, future.as_mut()).await {
        Ok(output) => Ok(output),
        Err(e) => {
            let cancel = source.cancel();
            let _ = futures::future::join(cancel, future).await;
            tracing::trace!("timed out sub-task acknowledged cancellation");
            Err(e)
        }
    }
}

/// Future returned by [`timeout`] and [`timeout_at`].
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[derive(Debug)]
pub struct Timeout<F> {
    #[pin]
    future: F,
    #[pin]
    sleep: Sleep,
}

impl<F> Timeout<F> {
    pub fn get_ref(&self) -> &F {
        &self.future
    }

    pub fn into_inner(self) -> F {
        self.future
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }

        match this.sleep.poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Error::DeadlineExceeded)),
            Poll::Pending => Poll::Pending,
        }
    }
}
