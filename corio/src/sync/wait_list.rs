use std::collections::BTreeMap;
use std::task::Waker;

pub(crate) type WaiterId = u64;

/// FIFO of suspended waiters, kept under the lock of the primitive that owns
/// it.
///
/// Notifying a waiter removes it from the list: a waiter that no longer finds
/// its id was notified. Wakers are handed back to the caller so they can be
/// woken once the lock is released.
#[derive(Debug, Default)]
pub(crate) struct WaitList {
    next_id: WaiterId,
    waiters: BTreeMap<WaiterId, Option<Waker>>,
}

impl WaitList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a waiter. Its waker may be set later with [`WaitList::update`].
    pub(crate) fn register(&mut self, waker: Option<&Waker>) -> WaiterId {
        let id = self.next_id;
        self.next_id += 1;
        self.waiters.insert(id, waker.cloned());
        id
    }

    /// Stores the latest waker. Returns `false` if the waiter was notified.
    pub(crate) fn update(&mut self, id: WaiterId, waker: &Waker) -> bool {
        match self.waiters.get_mut(&id) {
            Some(slot) => {
                match slot {
                    Some(current) if current.will_wake(waker) => {}
                    _ => *slot = Some(waker.clone()),
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, id: WaiterId) -> bool {
        self.waiters.contains_key(&id)
    }

    /// Returns `true` if the waiter was still waiting, `false` if it had been
    /// notified.
    pub(crate) fn remove(&mut self, id: WaiterId) -> bool {
        self.waiters.remove(&id).is_some()
    }

    /// Notifies the oldest waiter.
    pub(crate) fn notify_one(&mut self) -> Option<Waker> {
        self.waiters.pop_first().and_then(|(_, waker)| waker)
    }

    /// Notifies the oldest waiter, returning `false` if there was none.
    pub(crate) fn notify_one_into(&mut self, woken: &mut Vec<Waker>) -> bool {
        match self.waiters.pop_first() {
            Some((_, waker)) => {
                woken.extend(waker);
                true
            }
            None => false,
        }
    }

    pub(crate) fn notify_all(&mut self) -> Vec<Waker> {
        std::mem::take(&mut self.waiters)
            .into_values()
            .flatten()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_notify_in_fifo_order() {
        let mut list = WaitList::new();
        let (w1, d1) = mock_waker();
        let (w2, d2) = mock_waker();

        let first = list.register(Some(&w1));
        let second = list.register(Some(&w2));
        assert_eq!(list.len(), 2);

        list.notify_one().into_iter().for_each(Waker::wake);
        assert_eq!((d1.get_count(), d2.get_count()), (1, 0));
        assert!(!list.contains(first));
        assert!(list.contains(second));

        // Notified waiters are gone.
        assert!(!list.remove(first));
        assert!(list.remove(second));
        assert!(list.is_empty());
    }

    #[test]
    fn test_late_waker() {
        let mut list = WaitList::new();
        let (waker, data) = mock_waker();

        let id = list.register(None);
        assert!(list.update(id, &waker));

        list.notify_all().into_iter().for_each(Waker::wake);
        assert_eq!(data.get_count(), 1);
        assert!(!list.update(id, &waker));
    }

    #[test]
    fn test_notify_without_waker() {
        let mut list = WaitList::new();
        let mut woken = Vec::new();

        let id = list.register(None);
        assert!(list.notify_one_into(&mut woken));
        assert!(woken.is_empty());
        assert!(!list.contains(id));
        assert!(!list.notify_one_into(&mut woken));
    }
}
