use crate::error::TryPushError;
use std::fmt;

/// A fixed-capacity circular buffer owned by a single user.
///
/// `head` and `tail` are free-running stamps: the slot of a stamp is
/// `stamp % capacity` and `tail - head` is the number of stored items, so a
/// full ring is told apart from an empty one without a spare slot.
pub struct RingQueue<T> {
    slots: Box<[Option<T>]>,
    head: u64,
    tail: u64,
}

impl<T> RingQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[track_caller]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring queue capacity must be greater than 0");

        RingQueue {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Stamp of the next item to pop.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Stamp the next pushed item will get.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn push(&mut self, value: T) -> Result<(), TryPushError<T>> {
        if self.is_full() {
            return Err(TryPushError(value));
        }

        let slot = self.slot(self.tail);
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(value);
        self.tail += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let slot = self.slot(self.head);
        let value = self.slots[slot].take();
        debug_assert!(value.is_some());
        self.head += 1;
        value
    }

    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.slot(self.head)].as_ref()
    }

    fn slot(&self, stamp: u64) -> usize {
        (stamp % self.slots.len() as u64) as usize
    }
}

impl<T> Iterator for RingQueue<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len(), Some(self.len()))
    }
}

impl<T> fmt::Debug for RingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingQueue")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::single(1)]
    #[case::odd(3)]
    #[case::pow2(8)]
    fn test_wraps_around(#[case] capacity: usize) {
        let mut ring = RingQueue::with_capacity(capacity);

        for round in 0..4 {
            for i in 0..capacity {
                assert!(ring.push(round * 100 + i).is_ok());
            }
            assert!(ring.is_full());

            let rejected = ring.push(usize::MAX).unwrap_err();
            assert_eq!(rejected.into_inner(), usize::MAX);

            let popped = ring.by_ref().collect::<Vec<_>>();
            assert_eq!(popped, (0..capacity).map(|i| round * 100 + i).collect::<Vec<_>>());
        }

        assert_eq!(ring.head(), ring.tail());
        assert_eq!(ring.tail(), 4 * capacity as u64);
    }

    #[test]
    fn test_interleaved() {
        let mut ring = RingQueue::with_capacity(2);
        assert!(ring.push(1).is_ok());
        assert_eq!(ring.peek(), Some(&1));
        assert!(ring.push(2).is_ok());
        assert_eq!(ring.pop(), Some(1));
        assert!(ring.push(3).is_ok());
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
        assert!(ring.peek().is_none());
    }

    #[test]
    #[should_panic(expected = "capacity must be greater than 0")]
    fn test_zero_capacity_panics() {
        let _ = RingQueue::<u8>::with_capacity(0);
    }
}
