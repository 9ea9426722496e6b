use crate::future::{FutexWait, Op};
use crate::reactor::futex::futex_wake;
use crate::time::yield_now;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Locked, and at least one waiter may be blocked on the word.
const CONTENDED: u32 = 2;

/// An asynchronous mutual exclusion lock.
///
/// The lock is a single futex word. Contended lockers suspend on the word
/// through the reactor, so a waiting task never blocks its worker, and unlock
/// wakes one waiter with `futex(2)` from whatever thread drops the guard.
///
/// ```no_run
/// use corio::sync::Mutex;
/// use std::sync::Arc;
///
/// # #[corio::main]
/// # async fn main() {
/// let counter = Arc::new(Mutex::new(0));
///
/// let handles = (0..10)
///     .map(|_| {
///         let counter = Arc::clone(&counter);
///         corio::spawn(async move { *counter.lock().await += 1 })
///     })
///     .collect::<Vec<_>>();
///
/// for handle in handles {
///     handle.await.unwrap();
/// }
///
/// assert_eq!(*counter.lock().await, 10);
/// # }
/// ```
pub struct Mutex<T: ?Sized> {
    word: Arc<AtomicU32>,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by the lock word.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            word: Arc::new(AtomicU32::new(UNLOCKED)),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock without suspending.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MutexGuard::new(self))
    }

    /// Acquires the lock, suspending the task while it is held elsewhere.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.lock_until(None).await {
                return guard;
            }
        }
    }

    /// Acquires the lock unless `timeout` elapses first.
    pub async fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        self.lock_until(Instant::now().checked_add(timeout)).await
    }

    /// Acquires the lock unless `deadline` is reached first.
    pub async fn try_lock_until(&self, deadline: Instant) -> Option<MutexGuard<'_, T>> {
        self.lock_until(Some(deadline)).await
    }

    async fn lock_until(&self, deadline: Option<Instant>) -> Option<MutexGuard<'_, T>> {
        if let Some(guard) = self.try_lock() {
            return Some(guard);
        }

        // Mark the word contended so the holder wakes us on unlock.
        while self.word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            let mut wait = Op::new(FutexWait::new(Arc::clone(&self.word), CONTENDED));

            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return None;
                }
                wait = wait.deadline(remaining);
            }

            match wait.await {
                Ok(()) => {}
                Err(e) if e.is_deadline_exceeded() => return None,
                Err(e) => {
                    // No futex support in the ring, spin through the scheduler.
                    tracing::trace!("futex wait failed, yielding: {}", e);
                    yield_now().await;
                }
            }
        }

        Some(MutexGuard::new(self))
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED
            && let Err(e) = futex_wake(&self.word, 1)
        {
            tracing::warn!("failed to wake mutex waiter: {}", e);
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// RAII guard of a [`Mutex`]. The lock is released when the guard is dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
    _p: PhantomData<&'a mut T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(lock: &'a Mutex<T>) -> Self {
        MutexGuard {
            lock,
            _p: PhantomData,
        }
    }

    /// Returns the mutex this guard locks.
    pub fn mutex(guard: &Self) -> &'a Mutex<T> {
        guard.lock
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corio;
    use anyhow::Result;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(Mutex<u32>: Send, Sync);
    assert_impl_all!(MutexGuard<'static, u32>: Send, Sync);
    assert_not_impl_any!(Mutex<std::rc::Rc<u32>>: Send, Sync);
    assert_not_impl_any!(MutexGuard<'static, Cell<u32>>: Sync);

    #[corio::test]
    async fn test_try_lock() -> Result<()> {
        let mutex = Mutex::new(1);

        let guard = mutex.try_lock().expect("lock is free");
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());

        drop(guard);
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
        Ok(())
    }

    #[corio::test]
    async fn test_try_lock_for_times_out() -> Result<()> {
        let mutex = Mutex::new(());
        let _held = mutex.lock().await;

        let start = Instant::now();
        assert!(mutex.try_lock_for(Duration::from_millis(5)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(5));
        Ok(())
    }

    #[corio::test]
    async fn test_lock_handoff_between_tasks() -> Result<()> {
        let mutex = Arc::new(Mutex::new(Vec::new()));
        let held = mutex.lock().await;

        let waiter = corio::spawn({
            let mutex = Arc::clone(&mutex);
            async move { mutex.lock().await.push("waiter") }
        });

        corio::time::sleep(Duration::from_millis(2)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await?;
        assert_eq!(*mutex.lock().await, vec!["waiter"]);
        Ok(())
    }

    #[corio::test(flavor = "stealing", worker_threads = 4)]
    async fn test_mutual_exclusion_across_workers() -> Result<()> {
        let mutex = Arc::new(Mutex::new(0usize));
        let holders = Arc::new(AtomicUsize::new(0));
        let (tasks, rounds) = (16, 50);

        let handles = (0..tasks)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let holders = Arc::clone(&holders);
                corio::spawn_mt(async move {
                    for _ in 0..rounds {
                        let mut guard = mutex.lock().await;
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);

                        *guard += 1;
                        yield_now().await;

                        holders.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.await?;
        }

        assert_eq!(*mutex.lock().await, tasks * rounds);
        Ok(())
    }
}
