use std::pin::Pin;
use std::task::{Context, Poll};

/// Yields execution back to the worker.
///
/// The current task is pushed at the back of the ready queue and polled
/// again once every task queued before it ran.
///
/// ```no_run
/// # #[corio::main]
/// # async fn main() {
/// corio::spawn(async {
///     // Runs once we yield.
/// });
///
/// corio::time::yield_now().await;
/// # }
/// ```
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Only yield on first poll. Next time task is scheduled we will return.
        if self.yielded {
            return Poll::Ready(());
        }

        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corio;
    use anyhow::Result;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[corio::test]
    async fn test_yield_lets_queued_tasks_run() -> Result<()> {
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = Arc::clone(&order);
            corio::spawn(async move {
                order.lock().push("a1");
                yield_now().await;
                order.lock().push("a2");
            })
        };

        let second = {
            let order = Arc::clone(&order);
            corio::spawn(async move {
                order.lock().push("b");
            })
        };

        first.await?;
        second.await?;

        assert_eq!(*order.lock(), vec!["a1", "b", "a2"]);
        Ok(())
    }
}
