use std::collections::BTreeMap;
use std::task::Waker;
use std::time::Instant;

/// Position of a timer in the tree. The sequence number breaks ties between
/// equal deadlines in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TimerKey {
    deadline: Instant,
    seq: u64,
}

impl TimerKey {
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Ordered set of pending timed suspensions of one worker.
///
/// Membership means "scheduled": an entry is removed either when it fires or
/// when its owner cancels it.
#[derive(Debug, Default)]
pub(crate) struct TimerTree {
    timers: BTreeMap<TimerKey, Waker>,
    next_seq: u64,
}

impl TimerTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, deadline: Instant, waker: &Waker) -> TimerKey {
        let key = TimerKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.timers.insert(key, waker.clone());
        key
    }

    /// Returns `false` if the timer already fired.
    pub(crate) fn remove(&mut self, key: &TimerKey) -> bool {
        self.timers.remove(key).is_some()
    }

    /// Replaces the waker of a pending timer. Returns `false` if the timer
    /// already fired.
    pub(crate) fn update_waker(&mut self, key: &TimerKey, waker: &Waker) -> bool {
        match self.timers.get_mut(key) {
            Some(current) => {
                if !current.will_wake(waker) {
                    *current = waker.clone();
                }
                true
            }
            None => false,
        }
    }

    /// Removes every timer whose deadline is `<= now` and collects its waker,
    /// in deadline order.
    pub(crate) fn fire_due(&mut self, now: Instant, woken: &mut Vec<Waker>) -> usize {
        let mut fired = 0;

        while let Some(entry) = self.timers.first_entry() {
            if entry.key().deadline > now {
                break;
            }

            woken.push(entry.remove());
            fired += 1;
        }

        fired
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.first_key_value().map(|(key, _)| key.deadline)
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use std::time::Duration;

    #[test]
    fn test_fire_in_deadline_order() {
        let mut tree = TimerTree::new();
        let now = Instant::now();
        let (waker, data) = mock_waker();

        // Inserted out of order.
        for ms in [30, 10, 20] {
            tree.insert(now + Duration::from_millis(ms), &waker);
        }

        assert_eq!(tree.next_deadline(), Some(now + Duration::from_millis(10)));

        let mut woken = Vec::new();
        assert_eq!(tree.fire_due(now + Duration::from_millis(20), &mut woken), 2);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.next_deadline(), Some(now + Duration::from_millis(30)));

        woken.drain(..).for_each(Waker::wake);
        assert_eq!(data.get_count(), 2);
    }

    #[test]
    fn test_equal_deadlines_both_fire() {
        let mut tree = TimerTree::new();
        let deadline = Instant::now();
        let (w1, d1) = mock_waker();
        let (w2, d2) = mock_waker();

        let k1 = tree.insert(deadline, &w1);
        let k2 = tree.insert(deadline, &w2);
        assert!(k1 < k2);
        assert_eq!(tree.len(), 2);

        let mut woken = Vec::new();
        assert_eq!(tree.fire_due(deadline, &mut woken), 2);
        woken.drain(..).for_each(Waker::wake);

        assert_eq!(d1.get_count(), 1);
        assert_eq!(d2.get_count(), 1);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_and_update() {
        let mut tree = TimerTree::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        let (w1, d1) = mock_waker();
        let (w2, d2) = mock_waker();

        let key = tree.insert(deadline, &w1);
        assert_eq!(key.deadline(), deadline);
        assert!(tree.update_waker(&key, &w2));

        let mut woken = Vec::new();
        tree.fire_due(deadline, &mut woken);
        woken.drain(..).for_each(Waker::wake);
        assert_eq!((d1.get_count(), d2.get_count()), (0, 1));

        // Already fired.
        assert!(!tree.remove(&key));
        assert!(!tree.update_waker(&key, &w1));
        assert_eq!(tree.next_deadline(), None);
    }
}
