use crate::sync::CondVar;
use crate::utils::ScopeGuard;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// A value initialized once by an async initializer.
///
/// Concurrent callers of [`get_or_init`](CallOnce::get_or_init) wait for the
/// running initializer instead of starting their own. If the initializer is
/// dropped or panics, the next waiter runs its own.
pub struct CallOnce<T> {
    value: OnceLock<T>,
    running: AtomicBool,
    done: CondVar,
}

impl<T> CallOnce<T> {
    pub fn new() -> Self {
        CallOnce {
            value: OnceLock::new(),
            running: AtomicBool::new(false),
            done: CondVar::new(),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    pub async fn get_or_init<F, Fut>(&self, init: F) -> &T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            if let Some(value) = self.value.get() {
                return value;
            }

            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _release = ScopeGuard::new(|| {
                    self.running.store(false, Ordering::Release);
                    self.done.notify_all();
                });

                let value = init().await;
                return self.value.get_or_init(|| value);
            }

            let notified = self.done.notified();
            if self.value.get().is_some() || !self.running.load(Ordering::Acquire) {
                continue;
            }

            notified.await;
        }
    }
}

impl<T> Default for CallOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for CallOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOnce")
            .field("value", &self.value.get())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
