use crate::error::TryPushError;
use crate::sync::RingQueue;
use parking_lot::Mutex;
use std::fmt;

/// A bounded multi-producer multi-consumer queue. Never suspends: see
/// [`Queue`](crate::sync::Queue) for the waiting variant.
pub struct ConcurrentQueue<T> {
    ring: Mutex<RingQueue<T>>,
    capacity: usize,
}

impl<T> ConcurrentQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[track_caller]
    pub fn with_capacity(capacity: usize) -> Self {
        ConcurrentQueue {
            ring: Mutex::new(RingQueue::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        self.ring.lock().push(value)
    }

    pub fn try_pop(&self) -> Option<T> {
        self.ring.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.lock().is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for ConcurrentQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
