use crate::cancel::CancelAdaptor;
use crate::combinator::timeout;
use crate::error::{Error, Result};
use crate::sync::wait_list::{WaitList, WaiterId};
use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// A counting semaphore bounded to `[0, max]`.
///
/// [`acquire`](Semaphore::acquire) suspends while the count is zero and
/// [`release`](Semaphore::release) suspends while it is at `max`. Waiters are
/// served in FIFO order: a freed unit is handed directly to the oldest waiter.
pub struct Semaphore {
    max: usize,
    state: Mutex<State>,
}

struct State {
    count: usize,
    acquirers: WaitList,
    releasers: WaitList,
}

impl State {
    /// Hands units to waiters while it is possible. Returns the wakers to wake
    /// once the lock is released.
    fn balance(&mut self, max: usize) -> Vec<Waker> {
        let mut woken = Vec::new();

        while self.count > 0 && !self.acquirers.is_empty() {
            self.acquirers.notify_one_into(&mut woken);
            self.count -= 1;
        }

        while self.count < max && !self.releasers.is_empty() {
            self.releasers.notify_one_into(&mut woken);
            self.count += 1;
        }

        woken
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Acquire,
    Release,
}

impl Semaphore {
    /// # Panics
    ///
    /// Panics if `max` is zero or `initial > max`.
    #[track_caller]
    pub fn new(initial: usize, max: usize) -> Self {
        assert!(max > 0, "semaphore max must be greater than 0");
        assert!(initial <= max, "semaphore initial count {} exceeds max {}", initial, max);

        Semaphore {
            max,
            state: Mutex::new(State {
                count: initial,
                acquirers: WaitList::new(),
                releasers: WaitList::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Takes one unit without suspending. Fails if the count is zero or if
    /// other tasks are already waiting for one.
    pub fn try_acquire(&self) -> bool {
        self.try_op(Kind::Acquire)
    }

    /// Gives one unit back without suspending. Fails if the count is at `max`
    /// or if other tasks are already waiting to release.
    pub fn try_release(&self) -> bool {
        self.try_op(Kind::Release)
    }

    /// Takes one unit, suspending while the count is zero.
    pub fn acquire(&self) -> Wait<'_> {
        Wait::new(self, Kind::Acquire)
    }

    /// Gives one unit back, suspending while the count is at `max`.
    pub fn release(&self) -> Wait<'_> {
        Wait::new(self, Kind::Release)
    }

    /// Like [`acquire`](Semaphore::acquire), failing with
    /// [`Error::DeadlineExceeded`] after `duration`.
    pub async fn acquire_timeout(&self, duration: Duration) -> Result<()> {
        timeout(duration, self.acquire()).await
    }

    /// Like [`release`](Semaphore::release), failing with
    /// [`Error::DeadlineExceeded`] after `duration`.
    pub async fn release_timeout(&self, duration: Duration) -> Result<()> {
        timeout(duration, self.release()).await
    }

    fn try_op(&self, kind: Kind) -> bool {
        let woken = {
            let mut state = self.state.lock();

            match kind {
                Kind::Acquire if state.count > 0 && state.acquirers.is_empty() => state.count -= 1,
                Kind::Release if state.count < self.max && state.releasers.is_empty() => {
                    state.count += 1
                }
                _ => return false,
            }

            state.balance(self.max)
        };

        woken.into_iter().for_each(Waker::wake);
        true
    }

    fn waiters(state: &mut State, kind: Kind) -> &mut WaitList {
        match kind {
            Kind::Acquire => &mut state.acquirers,
            Kind::Release => &mut state.releasers,
        }
    }

    /// Withdraws a waiter. Returns `false` if it had already been served.
    fn withdraw(&self, id: WaiterId, kind: Kind) -> bool {
        Self::waiters(&mut self.state.lock(), kind).remove(id)
    }

    /// Withdraws a waiter. A waiter that was already served passes its unit
    /// to the next waiter of the same kind, or gives it back to the count when
    /// that keeps the count within `[0, max]`. Otherwise the served operation
    /// stands.
    fn abandon(&self, id: WaiterId, kind: Kind) {
        let mut woken = Vec::new();

        {
            let mut state = self.state.lock();

            if Self::waiters(&mut state, kind).remove(id) {
                return;
            }

            if !Self::waiters(&mut state, kind).is_empty() {
                Self::waiters(&mut state, kind).notify_one_into(&mut woken);
            } else {
                let undone = match kind {
                    Kind::Acquire if state.count < self.max => Some(state.count + 1),
                    Kind::Release if state.count > 0 => Some(state.count - 1),
                    _ => None,
                };

                if let Some(count) = undone {
                    state.count = count;
                    woken = state.balance(self.max);
                }
            }
        }

        woken.into_iter().for_each(Waker::wake);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("count", &state.count)
            .field("max", &self.max)
            .field("acquirers", &state.acquirers.len())
            .field("releasers", &state.releasers.len())
            .finish()
    }
}

/// Future returned by [`Semaphore::acquire`] and [`Semaphore::release`].
///
/// Dropping it before completion withdraws the request, giving back a unit
/// that was already handed over.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Wait<'a> {
    sem: &'a Semaphore,
    kind: Kind,
    id: Option<WaiterId>,
    done: bool,
}

impl<'a> Wait<'a> {
    fn new(sem: &'a Semaphore, kind: Kind) -> Self {
        Wait {
            sem,
            kind,
            id: None,
            done: false,
        }
    }
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        assert!(!self.done, "semaphore `Wait` polled after completion");
        let (sem, kind) = (self.sem, self.kind);

        if let Some(id) = self.id {
            let mut state = sem.state.lock();

            if Semaphore::waiters(&mut state, kind).update(id, cx.waker()) {
                return Poll::Pending;
            }

            drop(state);
            self.id = None;
            self.done = true;
            return Poll::Ready(());
        }

        if sem.try_op(kind) {
            self.done = true;
            return Poll::Ready(());
        }

        let mut state = sem.state.lock();
        let max = sem.max;

        // Re-check under the lock, `try_op` may have raced with a release.
        let available = match kind {
            Kind::Acquire => state.count > 0 && state.acquirers.is_empty(),
            Kind::Release => state.count < max && state.releasers.is_empty(),
        };

        if available {
            drop(state);
            return self.poll(cx);
        }

        let id = Semaphore::waiters(&mut state, kind).register(Some(cx.waker()));
        drop(state);

        self.id = Some(id);
        Poll::Pending
    }
}

impl CancelAdaptor for Wait<'_> {
    type Output = Result<()>;

    fn poll_run(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll(cx).map(Ok)
    }

    fn poll_cancel(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let (sem, kind) = (self.sem, self.kind);
        self.done = true;

        match self.id.take() {
            // Served before the cancellation landed, keep the unit.
            Some(id) if !sem.withdraw(id, kind) => Poll::Ready(Ok(())),
            _ => Poll::Ready(Err(Error::Canceled)),
        }
    }

    fn early_canceled(mut self: Pin<&mut Self>) -> Self::Output {
        self.done = true;
        Err(Error::Canceled)
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.sem.abandon(id, self.kind);
        }
    }
}

impl fmt::Debug for Wait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("kind", &self.kind)
            .field("waiting", &self.id.is_some())
            .finish()
    }
}
