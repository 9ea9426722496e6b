use crate::cancel::CancelAdaptor;
use crate::combinator::{timeout, timeout_at};
use crate::error::{Error, Result};
use crate::sync::MutexGuard;
use crate::sync::wait_list::{WaitList, WaiterId};
use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// A multi-shot condition variable.
///
/// Waiters are resumed in FIFO order. A notification only reaches waiters
/// that were registered when it was sent: use [`CondVar::notified`] before
/// checking the condition to avoid missing one.
#[derive(Default)]
pub struct CondVar {
    waiters: Mutex<WaitList>,
}

impl CondVar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter immediately and returns the future waiting for its
    /// notification.
    pub fn notified(&self) -> Notified<'_> {
        let id = self.waiters.lock().register(None);
        Notified {
            cv: self,
            id: Some(id),
        }
    }

    /// Resumes the oldest waiter. Returns `false` if nobody was waiting.
    pub fn notify_one(&self) -> bool {
        let mut woken = Vec::with_capacity(1);
        let notified = self.waiters.lock().notify_one_into(&mut woken);
        woken.into_iter().for_each(Waker::wake);
        notified
    }

    /// Resumes every waiter, returning how many were waiting.
    pub fn notify_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        let woken = waiters.notify_all();
        drop(waiters);

        woken.into_iter().for_each(Waker::wake);
        count
    }

    /// Unlocks `guard`, waits for a notification and locks the mutex again.
    pub async fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = MutexGuard::mutex(&guard);
        let notified = self.notified();
        drop(guard);

        notified.await;
        mutex.lock().await
    }

    /// Like [`wait`](CondVar::wait), giving up after `duration`. The returned
    /// flag is `true` if the wait timed out.
    pub async fn wait_timeout<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        duration: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let mutex = MutexGuard::mutex(&guard);
        let notified = self.notified();
        drop(guard);

        let timed_out = timeout(duration, notified).await.is_err();
        (mutex.lock().await, timed_out)
    }

    /// Like [`wait`](CondVar::wait), giving up at `deadline`. The returned
    /// flag is `true` if the wait timed out.
    pub async fn wait_until<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, bool) {
        let mutex = MutexGuard::mutex(&guard);
        let notified = self.notified();
        drop(guard);

        let timed_out = timeout_at(deadline, notified).await.is_err();
        (mutex.lock().await, timed_out)
    }

    pub fn num_waiters(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl fmt::Debug for CondVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondVar")
            .field("waiters", &self.num_waiters())
            .finish()
    }
}

/// Future returned by [`CondVar::notified`].
///
/// Dropping it after it was notified but before it was polled to completion
/// passes the notification on to the next waiter.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Notified<'a> {
    cv: &'a CondVar,
    id: Option<WaiterId>,
}

impl Notified<'_> {
    /// Withdraws the registration. Returns `false` if it was already notified.
    fn withdraw(&mut self) -> bool {
        match self.id.take() {
            Some(id) => self.cv.waiters.lock().remove(id),
            None => true,
        }
    }
}

impl Future for Notified<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let id = self.id.expect("`Notified` polled after completion");

        if self.cv.waiters.lock().update(id, cx.waker()) {
            return Poll::Pending;
        }

        self.id = None;
        Poll::Ready(())
    }
}

impl CancelAdaptor for Notified<'_> {
    type Output = Result<()>;

    fn poll_run(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll(cx).map(Ok)
    }

    fn poll_cancel(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.withdraw() {
            Poll::Ready(Err(Error::Canceled))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn early_canceled(mut self: Pin<&mut Self>) -> Self::Output {
        if !self.withdraw() {
            self.cv.notify_one();
        }
        Err(Error::Canceled)
    }
}

impl Drop for Notified<'_> {
    fn drop(&mut self) {
        if !self.withdraw() {
            self.cv.notify_one();
        }
    }
}

impl fmt::Debug for Notified<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notified").field("id", &self.id).finish()
    }
}

/// A single-shot event: once set it stays set and every wait completes
/// immediately.
#[derive(Default)]
pub struct OnceEvent {
    set: AtomicBool,
    cv: CondVar,
}

impl OnceEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event and resumes every waiter. Returns `false` if it was
    /// already set.
    pub fn set(&self) -> bool {
        if self.set.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cv.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }

        let notified = self.cv.notified();
        if self.is_set() {
            return;
        }

        notified.await;
    }
}

impl fmt::Debug for OnceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnceEvent")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corio;
    use crate::cancel::CancelSource;
    use crate::sync::Mutex as AsyncMutex;
    use crate::test_utils::mock_waker;
    use crate::time::yield_now;
    use anyhow::Result;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn spawn_waiters(cv: &Arc<CondVar>, woken: &Arc<AtomicUsize>, n: usize) -> Vec<crate::task::JoinHandle<()>> {
        (0..n)
            .map(|_| {
                let cv = Arc::clone(cv);
                let woken = Arc::clone(woken);
                corio::spawn(async move {
                    cv.notified().await;
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect()
    }

    #[test]
    fn test_notify_without_waiters() {
        let cv = CondVar::new();
        assert!(!cv.notify_one());
        assert_eq!(cv.notify_all(), 0);
    }

    #[test]
    fn test_registered_before_notify_is_not_lost() {
        let cv = CondVar::new();
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let mut notified = cv.notified();
        assert!(cv.notify_one());
        assert_eq!(data.get_count(), 0);

        assert!(Pin::new(&mut notified).poll(&mut cx).is_ready());
    }

    #[test]
    fn test_dropped_notification_is_forwarded() {
        let cv = CondVar::new();
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let first = cv.notified();
        let mut second = cv.notified();
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());

        assert!(cv.notify_one());
        drop(first);

        assert!(Pin::new(&mut second).poll(&mut cx).is_ready());
    }

    #[corio::test]
    async fn test_notify_one_resumes_exactly_one() -> Result<()> {
        let cv = Arc::new(CondVar::new());
        let woken = Arc::new(AtomicUsize::new(0));
        let handles = spawn_waiters(&cv, &woken, 3);

        while cv.num_waiters() < 3 {
            yield_now().await;
        }

        assert!(cv.notify_one());
        for _ in 0..4 {
            yield_now().await;
        }
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        assert_eq!(cv.notify_all(), 2);
        for handle in handles {
            handle.await?;
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[corio::test]
    async fn test_wait_with_predicate() -> Result<()> {
        let state = Arc::new((AsyncMutex::new(false), CondVar::new()));

        let waiter = corio::spawn({
            let state = Arc::clone(&state);
            async move {
                let (lock, cv) = &*state;
                let mut ready = lock.lock().await;
                while !*ready {
                    ready = cv.wait(ready).await;
                }
            }
        });

        yield_now().await;

        let (lock, cv) = &*state;
        *lock.lock().await = true;
        cv.notify_all();

        waiter.await?;
        Ok(())
    }

    #[corio::test]
    async fn test_wait_timeout() -> Result<()> {
        let lock = AsyncMutex::new(0);
        let cv = CondVar::new();

        let guard = lock.lock().await;
        let (guard, timed_out) = cv.wait_timeout(guard, Duration::from_millis(2)).await;
        assert!(timed_out);
        assert_eq!(*guard, 0);
        assert_eq!(cv.num_waiters(), 0);

        let deadline = Instant::now() + Duration::from_millis(2);
        let (_guard, timed_out) = cv.wait_until(guard, deadline).await;
        assert!(timed_out);
        Ok(())
    }

    #[corio::test]
    async fn test_cancel_wait() -> Result<()> {
        let cv = Arc::new(CondVar::new());
        let source = CancelSource::new();

        let waiter = corio::spawn({
            let cv = Arc::clone(&cv);
            let token = source.token();
            async move { token.guard(cv.notified()).await }
        });

        while cv.num_waiters() == 0 || source.num_registered() == 0 {
            yield_now().await;
        }

        source.cancel().await;
        assert!(matches!(waiter.await?, Err(Error::Canceled)));
        assert_eq!(cv.num_waiters(), 0);
        Ok(())
    }

    #[corio::test(flavor = "stealing", worker_threads = 4)]
    async fn test_once_event() -> Result<()> {
        let event = Arc::new(OnceEvent::new());

        let handles = (0..8)
            .map(|_| {
                let event = Arc::clone(&event);
                corio::spawn_mt(async move { event.wait().await })
            })
            .collect::<Vec<_>>();

        yield_now().await;
        assert!(event.set());
        assert!(!event.set());

        for handle in handles {
            handle.await?;
        }

        // Already set, does not suspend.
        event.wait().await;
        Ok(())
    }
}
