use std::any::Any;
use std::fmt;
use std::task::Waker;

/// Lifecycle of one in-flight kernel request.
///
/// `Submitted -> Completed -> (consumed by its Op)`, or
/// `Submitted -> Orphaned -> (released on completion)` when the future that
/// issued the request was dropped before the kernel answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationState {
    Submitted,
    Completed(i32),
    Orphaned,
}

/// What the reactor must do once a completion has been recorded.
pub(crate) enum CompletionEffect {
    /// The result is stored, wake the continuation (if any).
    Wake(Option<Waker>),

    /// Nobody is waiting for this record anymore, free its slot.
    Release,
}

/// Arena record for a kernel request, addressed by its slab index which is
/// also the `user_data` carried by the CQE.
pub(crate) struct Operation {
    pub(crate) state: OperationState,
    waker: Option<Waker>,

    /// Memory the kernel may still read or write, kept alive until the
    /// completion arrives.
    keepalive: Option<Box<dyn Any + Send>>,

    /// Detached records are internal bookkeeping (async cancel, linked
    /// timeouts) that nothing awaits.
    detached: bool,
}

impl Operation {
    pub(crate) fn new(waker: &Waker) -> Self {
        Self {
            state: OperationState::Submitted,
            waker: Some(waker.clone()),
            keepalive: None,
            detached: false,
        }
    }

    pub(crate) fn detached(keepalive: Option<Box<dyn Any + Send>>) -> Self {
        Self {
            state: OperationState::Submitted,
            waker: None,
            keepalive,
            detached: true,
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn set_waker(&mut self, waker: &Waker) {
        match &self.waker {
            Some(current) if current.will_wake(waker) => {}
            _ => self.waker = Some(waker.clone()),
        }
    }

    pub(crate) fn orphan(&mut self, keepalive: Option<Box<dyn Any + Send>>) {
        self.state = OperationState::Orphaned;
        self.waker = None;
        self.keepalive = keepalive;
    }

    pub(crate) fn on_completion(&mut self, res: i32) -> CompletionEffect {
        match self.state {
            OperationState::Submitted if !self.detached => {
                self.state = OperationState::Completed(res);
                CompletionEffect::Wake(self.waker.take())
            }
            OperationState::Completed(_) => {
                tracing::warn!(res, "duplicate completion for an operation, ignoring");
                CompletionEffect::Wake(None)
            }
            _ => CompletionEffect::Release,
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("state", &self.state)
            .field("has_waker", &self.waker.is_some())
            .field("has_keepalive", &self.keepalive.is_some())
            .field("detached", &self.detached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_completion_wakes_once() {
        let (waker, data) = mock_waker();
        let mut op = Operation::new(&waker);

        match op.on_completion(5) {
            CompletionEffect::Wake(Some(w)) => w.wake(),
            _ => panic!("expected a waker"),
        }

        assert_eq!(data.get_count(), 1);
        assert_eq!(op.state, OperationState::Completed(5));
        assert!(matches!(op.on_completion(6), CompletionEffect::Wake(None)));
    }

    #[test]
    fn test_orphan_is_released() {
        let (waker, _data) = mock_waker();
        let mut op = Operation::new(&waker);

        op.orphan(Some(Box::new(vec![0u8; 16])));
        assert!(matches!(op.on_completion(-libc::ECANCELED), CompletionEffect::Release));
    }

    #[test]
    fn test_detached_is_released() {
        let mut op = Operation::detached(None);
        assert!(op.is_detached());
        assert!(matches!(op.on_completion(0), CompletionEffect::Release));
    }
}
