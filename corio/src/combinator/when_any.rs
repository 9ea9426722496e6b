use crate::cancel::{CancelSource, CancelToken};
use crate::combinator::{when_all, when_all2};
use either::Either;
use std::fmt;
use std::future::poll_fn;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Output of [`when_any`]: which future finished first and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged<T> {
    pub index: usize,
    pub value: T,
}

/// Waits for the first future of `iter` to complete.
///
/// Futures are polled in iteration order, so when several are ready at once
/// the lowest index wins. The others are dropped with the returned future,
/// use [`when_any_cancel`] to let them acknowledge a cancellation instead.
///
/// # Panics
///
/// Panics if `iter` is empty.
#[track_caller]
pub fn when_any<I>(iter: I) -> WhenAny<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    let futures = iter.into_iter().map(Box::pin).collect::<Vec<_>>();
    assert!(!futures.is_empty(), "`when_any` needs at least one future");

    WhenAny { futures }
}

/// Waits for the first of two futures to complete. `a` is polled first.
pub async fn when_any2<A: Future, B: Future>(a: A, b: B) -> Either<A::Output, B::Output> {
    let mut a = std::pin::pin!(a);
    let mut b = std::pin::pin!(b);

    poll_fn(|cx| {
        if let Poll::Ready(v) = a.as_mut().poll(cx) {
            return Poll::Ready(Either::Left(v));
        }
        b.as_mut().poll(cx).map(Either::Right)
    })
    .await
}

/// Runs the futures built by `factories`, each under a child scope of
/// `parent`, and returns the first output.
///
/// Once a winner is known the child scope is canceled and the remaining
/// futures are driven until they complete, so their guarded operations get to
/// acknowledge the cancellation. Futures that ignore their token run to
/// completion.
///
/// # Panics
///
/// Panics if `factories` is empty.
pub async fn when_any_cancel<I, F, Fut>(parent: &CancelToken, factories: I) -> Tagged<Fut::Output>
where
    I: IntoIterator<Item = F>,
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future,
{
    let source = CancelSource::child_of(parent);

    let mut futures = factories
        .into_iter()
        .map(|factory| Some(Box::pin(factory(source.token()))))
        .collect::<Vec<_>>();
    assert!(!futures.is_empty(), "`when_any_cancel` needs at least one future");

    let winner = poll_fn(|cx| poll_first(&mut futures, cx)).await;

    let losers = futures.into_iter().flatten();
    when_all2(source.cancel(), when_all(losers)).await;

    tracing::trace!(index = winner.index, "when_any_cancel settled");
    winner
}

/// Polls each future in order. The first ready one is removed from `futures`.
fn poll_first<F: Future>(
    futures: &mut [Option<Pin<Box<F>>>],
    cx: &mut Context<'_>,
) -> Poll<Tagged<F::Output>> {
    for (index, slot) in futures.iter_mut().enumerate() {
        let Some(fut) = slot else {
            continue;
        };

        if let Poll::Ready(value) = fut.as_mut().poll(cx) {
            *slot = None;
            return Poll::Ready(Tagged { index, value });
        }
    }

    Poll::Pending
}

/// Future returned by [`when_any`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct WhenAny<F> {
    futures: Vec<Pin<Box<F>>>,
}

impl<F: Future> Future for WhenAny<F> {
    type Output = Tagged<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        for (index, fut) in self.futures.iter_mut().enumerate() {
            if let Poll::Ready(value) = fut.as_mut().poll(cx) {
                return Poll::Ready(Tagged { index, value });
            }
        }

        Poll::Pending
    }
}

impl<F> fmt::Debug for WhenAny<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhenAny")
            .field("len", &self.futures.len())
            .finish()
    }
}
