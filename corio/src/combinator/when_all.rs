use futures::future::{MaybeDone, maybe_done};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Waits for every future of `iter`, returning their outputs in iteration
/// order.
///
/// Completed futures are not polled again. An empty iterator resolves
/// immediately to an empty `Vec`.
pub fn when_all<I>(iter: I) -> WhenAll<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    let futures = iter
        .into_iter()
        .map(|f| Box::pin(maybe_done(f)))
        .collect::<Vec<_>>();

    WhenAll {
        remaining: futures.len(),
        futures,
    }
}

/// Waits for two futures of different types.
pub async fn when_all2<A: Future, B: Future>(a: A, b: B) -> (A::Output, B::Output) {
    futures::future::join(a, b).await
}

/// Waits for every future of `iter`, then returns either all the values or
/// the error of the first future, in iteration order, that failed.
///
/// Unlike `try_join_all`, a failure does not drop the other futures: every
/// one of them reaches completion before the error is returned.
pub async fn try_when_all<I, T, E>(iter: I) -> Result<Vec<T>, E>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<T, E>>,
{
    when_all(iter).await.into_iter().collect()
}

/// Future returned by [`when_all`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct WhenAll<F: Future> {
    futures: Vec<Pin<Box<MaybeDone<F>>>>,
    remaining: usize,
}

impl<F: Future> Future for WhenAll<F> {
    type Output = Vec<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut remaining = 0;

        for fut in self.futures.iter_mut() {
            if fut.as_mut().poll(cx).is_pending() {
                remaining += 1;
            }
        }

        self.remaining = remaining;
        if remaining > 0 {
            return Poll::Pending;
        }

        let outputs = std::mem::take(&mut self.futures)
            .into_iter()
            .map(|mut fut| match fut.as_mut().take_output() {
                Some(output) => output,
                None => panic!("`WhenAll` polled after completion"),
            })
            .collect();

        Poll::Ready(outputs)
    }
}

impl<F: Future> fmt::Debug for WhenAll<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhenAll")
            .field("len", &self.futures.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}
