use crate::cancel::CancelAdaptor;
use crate::combinator::timeout_at;
use crate::error::{Error, Result, TryPushError};
use crate::sync::{CondVar, ConcurrentQueue, Notified};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// A bounded async queue.
///
/// `push` suspends while the queue is full and `pop` while it is empty.
/// Producers wait on "became non-full" and consumers on "became non-empty",
/// so a push only ever wakes a consumer and a pop only ever wakes a producer.
///
/// [`Push`] and [`Pop`] run under a cancellation scope through
/// [`CancelToken::guard`](crate::cancel::CancelToken::guard): a canceled pop
/// resolves to [`Error::Canceled`] and a canceled push hands its value back.
/// Dropping a pending `Push` drops its value.
pub struct Queue<T> {
    items: ConcurrentQueue<T>,
    not_empty: CondVar,
    not_full: CondVar,
}

impl<T> Queue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[track_caller]
    pub fn with_capacity(capacity: usize) -> Self {
        Queue {
            items: ConcurrentQueue::with_capacity(capacity),
            not_empty: CondVar::new(),
            not_full: CondVar::new(),
        }
    }

    pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        self.items.try_push(value)?;
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        let value = self.items.try_pop()?;
        self.not_full.notify_one();
        Some(value)
    }

    /// Pushes `value`, suspending while the queue is full.
    pub fn push(&self, value: T) -> Push<'_, T> {
        Push {
            queue: self,
            value: Some(value),
            notified: None,
        }
    }

    /// Pops a value, suspending while the queue is empty.
    pub fn pop(&self) -> Pop<'_, T> {
        Pop {
            queue: self,
            notified: None,
        }
    }

    /// Pushes `value`, handing it back if the queue stays full for
    /// `duration`.
    pub async fn push_timeout(&self, value: T, duration: Duration) -> Result<(), TryPushError<T>> {
        self.push_until(value, Instant::now().checked_add(duration))
            .await
    }

    /// Pops a value, failing with [`Error::DeadlineExceeded`] if the queue
    /// stays empty for `duration`.
    pub async fn pop_timeout(&self, duration: Duration) -> Result<T> {
        self.pop_until(Instant::now().checked_add(duration)).await
    }

    async fn push_until(&self, mut value: T, deadline: Option<Instant>) -> Result<(), TryPushError<T>> {
        loop {
            value = match self.try_push(value) {
                Ok(()) => return Ok(()),
                Err(e) => e.into_inner(),
            };

            // Register before the second attempt so a pop in between is seen.
            let notified = self.not_full.notified();
            value = match self.try_push(value) {
                Ok(()) => return Ok(()),
                Err(e) => e.into_inner(),
            };

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return self.try_push(value);
                    }
                }
            }
        }
    }

    async fn pop_until(&self, deadline: Option<Instant>) -> Result<T> {
        loop {
            if let Some(value) = self.try_pop() {
                return Ok(value);
            }

            let notified = self.not_empty.notified();
            if let Some(value) = self.try_pop() {
                return Ok(value);
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return self.try_pop().ok_or(Error::DeadlineExceeded);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("producers_waiting", &self.not_full.num_waiters())
            .field("consumers_waiting", &self.not_empty.num_waiters())
            .finish()
    }
}

/// Future returned by [`Queue::push`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Push<'a, T> {
    queue: &'a Queue<T>,
    value: Option<T>,
    notified: Option<Notified<'a>>,
}

// `value` is moved in and out, never pinned.
impl<T> Unpin for Push<'_, T> {}

impl<T> Future for Push<'_, T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let queue = self.queue;

        loop {
            let Some(value) = self.value.take() else {
                panic!("`Push` polled after completion");
            };

            match queue.try_push(value) {
                Ok(()) => {
                    self.notified = None;
                    return Poll::Ready(());
                }
                Err(e) => self.value = Some(e.into_inner()),
            }

            // Register, then try again before suspending so a pop in between
            // is not missed.
            match self.notified.as_mut() {
                None => self.notified = Some(queue.not_full.notified()),
                Some(notified) => {
                    if Pin::new(notified).poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    self.notified = None;
                }
            }
        }
    }
}

impl<T> CancelAdaptor for Push<'_, T> {
    type Output = Result<(), TryPushError<T>>;

    fn poll_run(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll(cx).map(Ok)
    }

    /// Withdraws the push and hands the value back.
    fn poll_cancel(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(self.early_canceled())
    }

    fn early_canceled(mut self: Pin<&mut Self>) -> Self::Output {
        self.notified = None;
        match self.value.take() {
            Some(value) => Err(TryPushError(value)),
            None => panic!("`Push` canceled after completion"),
        }
    }
}

impl<T> fmt::Debug for Push<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Push")
            .field("waiting", &self.notified.is_some())
            .finish_non_exhaustive()
    }
}

/// Future returned by [`Queue::pop`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Pop<'a, T> {
    queue: &'a Queue<T>,
    notified: Option<Notified<'a>>,
}

impl<T> Future for Pop<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let queue = self.queue;

        loop {
            if let Some(value) = queue.try_pop() {
                self.notified = None;
                return Poll::Ready(value);
            }

            match self.notified.as_mut() {
                None => self.notified = Some(queue.not_empty.notified()),
                Some(notified) => {
                    if Pin::new(notified).poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    self.notified = None;
                }
            }
        }
    }
}

impl<T> CancelAdaptor for Pop<'_, T> {
    type Output = Result<T>;

    fn poll_run(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll(cx).map(Ok)
    }

    /// Withdraws the pop. A wake-up it had consumed moves on to the next
    /// consumer.
    fn poll_cancel(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.notified = None;
        Poll::Ready(Err(Error::Canceled))
    }

    fn early_canceled(mut self: Pin<&mut Self>) -> Self::Output {
        self.notified = None;
        Err(Error::Canceled)
    }
}

impl<T> fmt::Debug for Pop<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pop")
            .field("waiting", &self.notified.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corio;
    use crate::cancel::CancelSource;
    use crate::time::{sleep, yield_now};
    use anyhow::Result;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;

    assert_impl_all!(Push<'static, String>: Send, Unpin);
    assert_impl_all!(Pop<'static, String>: Send, Unpin);

    #[corio::test]
    async fn test_capacity_one_keeps_order() -> Result<()> {
        let queue = Arc::new(Queue::with_capacity(1));

        let producer = corio::spawn({
            let queue = Arc::clone(&queue);
            async move {
                for i in 0..10 {
                    queue.push(i).await;
                }
            }
        });

        let mut popped = Vec::new();
        for _ in 0..10 {
            popped.push(queue.pop().await);
            assert!(queue.len() <= 1);
        }

        producer.await?;
        assert_eq!(popped, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
        Ok(())
    }

    #[rstest]
    #[case::unbuffered(1, 4)]
    #[case::buffered(8, 4)]
    #[corio::test(flavor = "stealing", worker_threads = 4)]
    async fn test_many_producers_many_consumers(
        #[case] capacity: usize,
        #[case] tasks: usize,
    ) -> Result<()> {
        let queue = Arc::new(Queue::with_capacity(capacity));
        let per_task = 200;

        let producers = (0..tasks)
            .map(|p| {
                let queue = Arc::clone(&queue);
                corio::spawn_mt(async move {
                    for i in 0..per_task {
                        queue.push(p * per_task + i).await;
                    }
                })
            })
            .collect::<Vec<_>>();

        let consumers = (0..tasks)
            .map(|_| {
                let queue = Arc::clone(&queue);
                corio::spawn_mt(async move {
                    let mut seen = Vec::with_capacity(per_task);
                    for _ in 0..per_task {
                        seen.push(queue.pop().await);
                    }
                    seen
                })
            })
            .collect::<Vec<_>>();

        for producer in producers {
            producer.await?;
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await?);
        }

        all.sort_unstable();
        assert_eq!(all, (0..tasks * per_task).collect::<Vec<_>>());
        Ok(())
    }

    #[corio::test]
    async fn test_timeouts() -> Result<()> {
        let queue = Queue::with_capacity(1);

        let err = queue.pop_timeout(Duration::from_millis(2)).await.unwrap_err();
        assert_eq!(err, Error::DeadlineExceeded);

        queue.push_timeout(1, Duration::from_millis(2)).await?;
        let rejected = queue.push_timeout(2, Duration::from_millis(2)).await.unwrap_err();
        assert_eq!(rejected.into_inner(), 2);

        assert_eq!(queue.pop_timeout(Duration::from_millis(2)).await?, 1);
        Ok(())
    }

    #[corio::test]
    async fn test_try_ops_wake_waiters() -> Result<()> {
        let queue = Arc::new(Queue::with_capacity(1));

        let consumer = corio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await }
        });

        sleep(Duration::from_millis(1)).await;
        assert!(queue.try_push(7).is_ok());
        assert_eq!(consumer.await?, 7);
        Ok(())
    }

    #[corio::test]
    async fn test_abort_pending_pop() -> Result<()> {
        let queue = Arc::new(Queue::<u32>::with_capacity(1));
        let source = CancelSource::new();

        let consumer = corio::spawn({
            let queue = Arc::clone(&queue);
            let token = source.token();
            async move { token.abortable(queue.pop()).await }
        });

        while source.num_registered() == 0 {
            yield_now().await;
        }

        source.cancel().await;
        assert!(matches!(consumer.await?, Err(Error::Canceled)));

        // The withdrawn consumer does not swallow the next value.
        assert!(queue.try_push(1).is_ok());
        assert_eq!(queue.try_pop(), Some(1));
        Ok(())
    }

    #[corio::test]
    async fn test_cancel_guarded_pop() -> Result<()> {
        let queue = Arc::new(Queue::<u32>::with_capacity(1));
        let source = CancelSource::new();

        let consumer = corio::spawn({
            let queue = Arc::clone(&queue);
            let token = source.token();
            async move { token.guard(queue.pop()).await }
        });

        while source.num_registered() == 0 {
            yield_now().await;
        }

        source.cancel().await;
        assert!(matches!(consumer.await?, Err(Error::Canceled)));
        assert_eq!(queue.not_empty.num_waiters(), 0);

        assert!(queue.try_push(1).is_ok());
        assert_eq!(queue.try_pop(), Some(1));
        Ok(())
    }

    #[corio::test]
    async fn test_cancel_guarded_push_returns_value() -> Result<()> {
        let queue = Arc::new(Queue::with_capacity(1));
        queue.push(1).await;

        let source = CancelSource::new();
        let producer = corio::spawn({
            let queue = Arc::clone(&queue);
            let token = source.token();
            async move { token.guard(queue.push(2)).await }
        });

        while source.num_registered() == 0 {
            yield_now().await;
        }

        source.cancel().await;
        let rejected = producer.await?.unwrap_err();
        assert_eq!(rejected.into_inner(), 2);

        // Only the first value made it in.
        assert_eq!(queue.pop().await, 1);
        assert!(queue.is_empty());
        Ok(())
    }

    #[corio::test]
    async fn test_guarded_pop_completes_normally() -> Result<()> {
        let queue = Queue::with_capacity(2);
        let source = CancelSource::new();

        queue.push(5).await;
        assert_eq!(source.token().guard(queue.pop()).await?, 5);
        Ok(())
    }
}
