use crate::error::{Error, Result};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

const PENDING: u8 = 0;
const COMPLETE: u8 = 1;
const CONSUMED: u8 = 2;

struct Shared<T> {
    state: AtomicU8,
    value: Mutex<Option<Result<T>>>,
    waker: AtomicWaker,
}

/// Creates a one-shot value-or-error transfer.
///
/// The two halves may live on different workers or plain OS threads. The
/// consumer is resumed on the worker that polled it last.
pub fn channel<T>() -> (FutureSource<T>, FutureToken<T>) {
    let shared = Arc::new(Shared {
        state: AtomicU8::new(PENDING),
        value: Mutex::new(None),
        waker: AtomicWaker::new(),
    });

    (
        FutureSource {
            shared: Some(Arc::clone(&shared)),
        },
        FutureToken { shared },
    )
}

/// Producing half of a [`channel`]. Dropping it without a value resolves the
/// consumer with [`Error::Closed`].
pub struct FutureSource<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> FutureSource<T> {
    pub fn set_value(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn set_error(self, error: Error) {
        self.complete(Err(error));
    }

    /// Returns `true` once the consumer has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared
            .as_ref()
            .is_none_or(|shared| Arc::strong_count(shared) == 1)
    }

    fn complete(mut self, res: Result<T>) {
        if let Some(shared) = self.shared.take() {
            Self::publish(&shared, res);
        }
    }

    fn publish(shared: &Shared<T>, res: Result<T>) {
        *shared.value.lock() = Some(res);
        let prev = shared.state.swap(COMPLETE, Ordering::AcqRel);
        assert_eq!(prev, PENDING, "one-shot value written twice");
        shared.waker.wake();
    }
}

impl<T> Drop for FutureSource<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            Self::publish(&shared, Err(Error::Closed));
        }
    }
}

impl<T> fmt::Debug for FutureSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureSource")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Consuming half of a [`channel`], resolving to the produced value or error.
///
/// # Panics
///
/// Polling it again after it returned `Ready` panics.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct FutureToken<T> {
    shared: Arc<Shared<T>>,
}

impl<T> FutureToken<T> {
    /// Returns `true` if the producer wrote a value or an error, or was
    /// dropped.
    pub fn is_ready(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == COMPLETE
    }

    fn take(&self) -> Result<T> {
        self.shared.state.store(CONSUMED, Ordering::Release);
        match self.shared.value.lock().take() {
            Some(res) => res,
            None => Err(Error::Closed),
        }
    }
}

impl<T> Future for FutureToken<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.shared.state.load(Ordering::Acquire) {
            COMPLETE => return Poll::Ready(self.take()),
            CONSUMED => panic!("`FutureToken` polled after completion"),
            _ => {}
        }

        self.shared.waker.register(cx.waker());

        // The producer may have completed before the waker was stored.
        if self.shared.state.load(Ordering::Acquire) == COMPLETE {
            return Poll::Ready(self.take());
        }

        Poll::Pending
    }
}

impl<T> fmt::Debug for FutureToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureToken")
            .field("ready", &self.is_ready())
            .finish()
    }
}
