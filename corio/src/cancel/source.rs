use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use crate::cancel::{CancelAdaptor, Guarded};

/// Identity of a registration, stable for its whole lifetime.
pub(crate) type RegistrationId = u64;

enum Slot {
    /// An operation suspended under the scope.
    Op(Waker),

    /// A child scope, acknowledged once it is canceled and drained.
    Child(Weak<Scope>),
}

#[derive(Default)]
struct Registry {
    next_id: RegistrationId,
    slots: BTreeMap<RegistrationId, Slot>,

    /// Callers of `cancel` waiting for the registry to drain.
    cancellers: Vec<Waker>,
}

impl Registry {
    fn insert(&mut self, slot: Slot) -> RegistrationId {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, slot);
        id
    }
}

pub(crate) struct Scope {
    canceled: AtomicBool,
    registry: Mutex<Registry>,
    parent: Option<(Arc<Scope>, RegistrationId)>,
}

impl Scope {
    fn new() -> Arc<Self> {
        Arc::new(Scope {
            canceled: AtomicBool::new(false),
            registry: Mutex::new(Registry::default()),
            parent: None,
        })
    }

    fn new_child(parent: &Arc<Scope>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let id = parent.register_child(weak.clone());

            Scope {
                // Children of a canceled scope are born canceled.
                canceled: AtomicBool::new(id.is_none()),
                registry: Mutex::new(Registry::default()),
                parent: id.map(|id| (Arc::clone(parent), id)),
            }
        })
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Returns `None` when the scope is already canceled.
    pub(crate) fn register(&self, waker: &Waker) -> Option<RegistrationId> {
        let mut registry = self.registry.lock();

        if self.is_canceled() {
            return None;
        }

        Some(registry.insert(Slot::Op(waker.clone())))
    }

    fn register_child(&self, child: Weak<Scope>) -> Option<RegistrationId> {
        let mut registry = self.registry.lock();

        if self.is_canceled() {
            return None;
        }

        Some(registry.insert(Slot::Child(child)))
    }

    pub(crate) fn update_waker(&self, id: RegistrationId, waker: &Waker) {
        if let Some(Slot::Op(current)) = self.registry.lock().slots.get_mut(&id)
            && !current.will_wake(waker)
        {
            *current = waker.clone();
        }
    }

    /// Removes a registration. This is the acknowledgment when the scope is
    /// being canceled.
    pub(crate) fn deregister(&self, id: RegistrationId) {
        let drained = {
            let mut registry = self.registry.lock();
            if registry.slots.remove(&id).is_none() {
                return;
            }

            self.is_canceled() && registry.slots.is_empty()
        };

        if drained {
            self.on_drained();
        }
    }

    /// Sets the flag and asks every registered operation to unblock itself.
    pub(crate) fn trigger(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }

        let (wakers, children, drained) = {
            let registry = self.registry.lock();
            let mut wakers = Vec::new();
            let mut children = Vec::new();

            for slot in registry.slots.values() {
                match slot {
                    Slot::Op(waker) => wakers.push(waker.clone()),
                    Slot::Child(child) => children.extend(child.upgrade()),
                }
            }

            (wakers, children, registry.slots.is_empty())
        };

        tracing::trace!(ops = wakers.len(), children = children.len(), "canceling scope");

        wakers.into_iter().for_each(Waker::wake);
        children.iter().for_each(|child| child.trigger());

        if drained {
            self.on_drained();
        }
    }

    fn on_drained(&self) {
        let cancellers = std::mem::take(&mut self.registry.lock().cancellers);
        cancellers.into_iter().for_each(Waker::wake);

        if let Some((parent, id)) = &self.parent {
            parent.deregister(*id);
        }
    }

    fn poll_drained(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut registry = self.registry.lock();

        if registry.slots.is_empty() {
            return Poll::Ready(());
        }

        if !registry.cancellers.iter().any(|w| w.will_wake(cx.waker())) {
            registry.cancellers.push(cx.waker().clone());
        }

        Poll::Pending
    }

    fn len(&self) -> usize {
        self.registry.lock().slots.len()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some((parent, id)) = self.parent.take() {
            parent.deregister(id);
        }
    }
}

/// Owner of a cancellation scope.
///
/// Dropping the source does not cancel anything: operations registered
/// through its tokens keep running.
pub struct CancelSource {
    scope: Arc<Scope>,
}

impl CancelSource {
    pub fn new() -> Self {
        CancelSource { scope: Scope::new() }
    }

    /// Creates a scope that is canceled along with `parent`. Canceling the
    /// parent waits for the acknowledgments of the child's operations too.
    ///
    /// A child of an already canceled scope starts canceled.
    pub fn child_of(parent: &CancelToken) -> Self {
        CancelSource {
            scope: Scope::new_child(&parent.scope),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            scope: Arc::clone(&self.scope),
        }
    }

    /// Cancels the scope.
    ///
    /// The flag is set immediately. The returned future resolves once every
    /// operation registered under the scope, and under its child scopes,
    /// acknowledged the cancellation.
    pub fn cancel(&self) -> Cancel<'_> {
        self.scope.trigger();
        Cancel { scope: &self.scope }
    }

    pub fn is_canceled(&self) -> bool {
        self.scope.is_canceled()
    }

    /// Number of operations and child scopes currently registered.
    pub fn num_registered(&self) -> usize {
        self.scope.len()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("canceled", &self.is_canceled())
            .field("registered", &self.num_registered())
            .finish()
    }
}

/// Future returned by [`CancelSource::cancel`].
#[must_use = "cancellation is only acknowledged once the future is awaited"]
pub struct Cancel<'a> {
    scope: &'a Scope,
}

impl Future for Cancel<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.scope.poll_drained(cx)
    }
}

/// Capability to register operations under a scope and to observe it.
#[derive(Clone)]
pub struct CancelToken {
    pub(crate) scope: Arc<Scope>,
}

impl CancelToken {
    pub fn is_canceled(&self) -> bool {
        self.scope.is_canceled()
    }

    /// Runs `op` under this scope.
    ///
    /// If the scope is already canceled, `op` never starts and the guard
    /// resolves with its early-canceled value.
    pub fn guard<A: CancelAdaptor>(&self, op: A) -> Guarded<A> {
        Guarded::new(op, self.clone())
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
