/// Runs a closure when dropped, including during unwinding.
///
/// Used to restore state that must not be left half-updated when a future is
/// dropped or a callback panics.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    on_exit: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(on_exit: F) -> Self {
        ScopeGuard {
            on_exit: Some(on_exit),
        }
    }

    /// The closure will not run.
    pub(crate) fn disarm(mut self) {
        self.on_exit = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(on_exit) = self.on_exit.take() {
            on_exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_runs_on_scope_exit() {
        let ran = Cell::new(0);
        {
            let _guard = ScopeGuard::new(|| ran.set(ran.get() + 1));
            assert_eq!(ran.get(), 0);
        }
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn test_disarmed() {
        let ran = Cell::new(false);
        ScopeGuard::new(|| ran.set(true)).disarm();
        assert!(!ran.get());
    }

    #[test]
    fn test_runs_on_panic() {
        let ran = Cell::new(false);
        let res = catch_unwind(AssertUnwindSafe(|| {
            let _guard = ScopeGuard::new(|| ran.set(true));
            panic!("boom");
        }));

        assert!(res.is_err());
        assert!(ran.get());
    }
}
