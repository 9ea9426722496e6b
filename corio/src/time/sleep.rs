use crate::cancel::{CancelAdaptor, CancelToken, Guarded};
use crate::context;
use crate::error::{Error, Result};
use crate::task::Header;
use crate::time::TimerKey;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::{Duration, Instant};

/// Roughly 30 years, used when `now + duration` overflows.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Waits until `duration` has elapsed.
///
/// The sleep is armed on the worker that first polls it, no kernel request is
/// involved. A zero duration completes on first poll without suspending.
///
/// # Panics
///
/// Polling a `Sleep` outside of a runtime worker panics.
pub fn sleep(duration: Duration) -> Sleep {
    let now = Instant::now();
    let deadline = now
        .checked_add(duration)
        .unwrap_or_else(|| now + FAR_FUTURE);

    Sleep::new(deadline)
}

/// Waits until `deadline` is reached.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep::new(deadline)
}

/// Like [`sleep`], but ends early with [`Error::Canceled`] when `token` is
/// canceled. The canceling side waits until the sleep has observed it.
///
/// ```no_run
/// # use corio::cancel::CancelSource;
/// # use std::time::Duration;
/// # #[corio::main]
/// # async fn main() {
/// let source = CancelSource::new();
/// let token = source.token();
///
/// let handle = corio::spawn(async move {
///     corio::time::sleep_cancellable(Duration::from_secs(60), &token).await
/// });
///
/// corio::time::yield_now().await;
/// source.cancel().await;
/// assert!(handle.await.unwrap().unwrap_err().is_canceled());
/// # }
/// ```
pub fn sleep_cancellable(duration: Duration, token: &CancelToken) -> Guarded<Sleep> {
    token.guard(sleep(duration))
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Sleep {
    deadline: Instant,
    entry: Option<Entry>,
}

/// Where the timer is armed.
struct Entry {
    worker: usize,
    key: TimerKey,

    /// Task that armed the timer. It stays on `worker` until the entry is gone.
    task: Option<Arc<Header>>,
}

impl Sleep {
    fn new(deadline: Instant) -> Self {
        Sleep {
            deadline,
            entry: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Moves the deadline. The sleep is re-armed on its next poll.
    pub fn reset(&mut self, deadline: Instant) {
        self.deregister();
        self.deadline = deadline;
    }

    fn register(&mut self, cx: &Context<'_>) {
        let (worker, key) = context::with_core(|core| {
            let key = core.timers.borrow_mut().insert(self.deadline, cx.waker());
            (core.index, key)
        });

        let task = context::current_header();
        if let Some(task) = &task {
            task.increment_pending_ops();
        }

        self.entry = Some(Entry { worker, key, task });
    }

    fn deregister(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };

        // An entry armed on another worker fires into a stale waker, which
        // only costs a spurious wake-up.
        context::try_with_context(|ctx| {
            if ctx.core.index == entry.worker
                && let Ok(mut timers) = ctx.core.timers.try_borrow_mut()
            {
                timers.remove(&entry.key);
            }
        });

        if let Some(task) = entry.task {
            task.decrement_pending_ops();
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.is_elapsed() {
            this.deregister();
            return Poll::Ready(());
        }

        let current = context::with_core(|core| core.index);

        match &this.entry {
            Some(entry) if entry.worker == current => {
                let armed = context::with_timers(|timers| timers.update_waker(&entry.key, cx.waker()));

                // Fired on a tick whose clock read was ahead of ours.
                if !armed {
                    this.deregister();
                    this.register(cx);
                }
            }
            _ => {
                this.deregister();
                this.register(cx);
            }
        }

        Poll::Pending
    }
}

impl CancelAdaptor for Sleep {
    type Output = Result<()>;

    fn poll_run(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        ready!(self.poll(cx));
        Poll::Ready(Ok(()))
    }

    fn poll_cancel(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().deregister();
        Poll::Ready(Err(Error::Canceled))
    }

    fn early_canceled(self: Pin<&mut Self>) -> Self::Output {
        Err(Error::Canceled)
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("armed", &self.entry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corio;
    use crate::cancel::CancelSource;
    use crate::test_utils::*;
    use anyhow::Result;
    use rstest::rstest;

    #[rstest]
    #[case::one_ms(Duration::from_millis(1))]
    #[case::five_ms(Duration::from_millis(5))]
    #[case::twenty_ms(Duration::from_millis(20))]
    #[corio::test]
    async fn test_sleep_duration_is_accurate(#[case] duration: Duration) -> Result<()> {
        let start = Instant::now();
        sleep(duration).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= duration, "slept {:?}, expected >= {:?}", elapsed, duration);

        // Generous margin, the test machine may be loaded.
        let upper_bound = duration + Duration::from_millis(50);
        assert!(elapsed < upper_bound, "slept {:?}, expected < {:?}", elapsed, upper_bound);

        Ok(())
    }

    #[corio::test]
    async fn test_zero_sleep_is_ready() -> Result<()> {
        let mut sleep = sleep(Duration::ZERO);
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut sleep).poll(&mut cx).is_ready());
        Ok(())
    }

    #[corio::test]
    async fn test_dropped_sleep_disarms_timer() -> Result<()> {
        let mut sleep = sleep(Duration::from_secs(10));
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        assert_eq!(context::with_timers(|t| t.len()), 1);

        drop(sleep);
        assert_eq!(context::with_timers(|t| t.len()), 0);
        assert_eq!(data.get_count(), 0);
        Ok(())
    }

    #[corio::test]
    async fn test_sleep_until_reset() -> Result<()> {
        let start = Instant::now();
        let mut sleep = sleep_until(start + Duration::from_secs(10));
        sleep.reset(start + Duration::from_millis(2));

        sleep.await;
        assert!(start.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[corio::test]
    async fn test_sleep_cancellable() -> Result<()> {
        let source = CancelSource::new();
        let token = source.token();

        let handle = corio::spawn(async move {
            sleep_cancellable(Duration::from_secs(10), &token).await
        });

        // Let the sleep register itself.
        corio::time::yield_now().await;

        let start = Instant::now();
        source.cancel().await;
        assert!(source.is_canceled());

        let res = handle.await?;
        assert!(matches!(res, Err(Error::Canceled)));
        assert!(start.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[corio::test]
    async fn test_sleep_cancellable_early_canceled() -> Result<()> {
        let source = CancelSource::new();
        source.cancel().await;

        let res = sleep_cancellable(Duration::from_secs(10), &source.token()).await;
        assert!(matches!(res, Err(Error::Canceled)));
        Ok(())
    }
}
