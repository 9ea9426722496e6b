use crate::runtime::Schedule;
use crate::task::{Id, Task};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

/// Scheduler dropping every task it is handed.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct DummyScheduler;

impl Schedule for DummyScheduler {
    fn schedule(&self, _task: Task) {}

    fn release(&self, _id: &Id) {}
}

/// Scheduler queuing tasks until the test runs them.
#[derive(Debug, Default, Clone)]
pub(crate) struct CountingScheduler {
    queue: Arc<Mutex<VecDeque<Task>>>,
    scheduled: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl CountingScheduler {
    /// Number of `schedule` calls so far.
    pub(crate) fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Runs queued tasks until the queue stays empty.
    pub(crate) fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            // Release the lock before running, the task may reschedule itself.
            let Some(task) = self.queue.lock().pop_front() else {
                return ran;
            };
            task.run();
            ran += 1;
        }
    }
}

impl Schedule for CountingScheduler {
    fn schedule(&self, task: Task) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().push_back(task);
    }

    fn release(&self, _id: &Id) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub(crate) struct WakerData {
    wake_count: AtomicUsize,
}

impl WakerData {
    pub(crate) fn get_count(&self) -> usize {
        self.wake_count.load(Ordering::SeqCst)
    }
}

impl Wake for WakerData {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// A waker counting how many times it was woken.
pub(crate) fn mock_waker() -> (Waker, Arc<WakerData>) {
    let data = Arc::new(WakerData::default());
    (Waker::from(Arc::clone(&data)), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_waker_counts() {
        let (waker, data) = mock_waker();
        waker.wake_by_ref();
        assert_eq!(data.get_count(), 1);

        let cloned = waker.clone();
        cloned.wake();
        assert_eq!(data.get_count(), 2);

        drop(waker);
        assert_eq!(data.get_count(), 2);
    }
}
