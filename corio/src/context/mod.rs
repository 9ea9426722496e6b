//! Thread-local runtime context.
//!
//! A worker thread *enters* the context once, before running its event loop,
//! and every API that needs the current worker (spawning, submitting I/O,
//! arming timers) reads it from here. Only the owning thread ever touches the
//! [`Core`], so it uses plain `RefCell`s for interior mutability.
use crate::reactor::Reactor;
use crate::runtime::Handle;
use crate::task::{Header, Id};
use crate::time::TimerTree;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread_local;

mod core;
pub(crate) use self::core::Core;

mod shared;
pub(crate) use self::shared::{Remote, Shared};

/// Everything a worker thread owns: the runtime handle and its local core.
pub(crate) struct Context {
    pub(crate) handle: Handle,
    pub(crate) core: Core,
}

thread_local! {
    static CONTEXT: RefCell<Option<Rc<Context>>> = const { RefCell::new(None) };

    /// Header of the task being polled on this thread. The root future has none.
    static CURRENT_TASK: RefCell<Option<Arc<Header>>> = const { RefCell::new(None) };
}

/// Clears the thread-local context on drop.
#[must_use = "the context is exited as soon as the guard is dropped"]
pub(crate) struct EnterGuard {
    _p: std::marker::PhantomData<Rc<()>>,
}

/// Installs a worker context on the current thread.
///
/// # Panics
///
/// Panics when the thread already runs a worker: runtimes cannot be nested.
#[track_caller]
pub(crate) fn enter(handle: Handle, core: Core) -> EnterGuard {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        assert!(
            ctx.is_none(),
            "Cannot start a runtime from within a runtime. This happens because a function \
             attempted to block the current thread while it is driving asynchronous tasks."
        );
        *ctx = Some(Rc::new(Context { handle, core }));
    });

    EnterGuard {
        _p: std::marker::PhantomData,
    }
}

impl EnterGuard {
    /// Leaves the context and hands the core back to the caller.
    pub(crate) fn exit(self) -> Option<Core> {
        let ctx = CONTEXT.with(|ctx| ctx.borrow_mut().take());
        std::mem::forget(self);

        ctx.and_then(|ctx| Rc::try_unwrap(ctx).ok()).map(|ctx| ctx.core)
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        // Bind first: dropping the core may run arbitrary drop glue that reads
        // the context.
        let ctx = CONTEXT.with(|ctx| ctx.borrow_mut().take());
        drop(ctx);
    }
}

/// Returns the context of the current worker, if any.
pub(crate) fn current() -> Option<Rc<Context>> {
    CONTEXT.with(|ctx| ctx.borrow().clone())
}

#[track_caller]
pub(crate) fn expect_current() -> Rc<Context> {
    current().expect("must be called from a corio runtime worker")
}

/// True when the current thread drives a runtime worker.
pub(crate) fn is_worker_thread() -> bool {
    CONTEXT.with(|ctx| ctx.borrow().is_some())
}

pub(crate) fn try_with_context<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Context) -> R,
{
    current().map(|ctx| f(&ctx))
}

#[track_caller]
pub(crate) fn with_context<F, R>(f: F) -> R
where
    F: FnOnce(&Context) -> R,
{
    f(&expect_current())
}

#[track_caller]
#[inline(always)]
pub(crate) fn with_core<F, R>(f: F) -> R
where
    F: FnOnce(&Core) -> R,
{
    with_context(|ctx| f(&ctx.core))
}

/// Gives access to the reactor of the current worker.
///
/// Never hold the borrow while waking tasks: the wakes of a same-thread task
/// only push it to the ready queue, but user `Drop` impls may submit I/O.
#[track_caller]
#[inline(always)]
pub(crate) fn with_reactor<F, R>(f: F) -> R
where
    F: FnOnce(&mut dyn Reactor) -> R,
{
    with_core(|core| f(&mut **core.reactor.borrow_mut()))
}

pub(crate) fn try_with_reactor<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut dyn Reactor) -> R,
{
    try_with_context(|ctx| match ctx.core.reactor.try_borrow_mut() {
        Ok(mut reactor) => Some(f(&mut **reactor)),
        Err(_) => None,
    })
    .flatten()
}

#[track_caller]
#[inline(always)]
pub(crate) fn with_timers<F, R>(f: F) -> R
where
    F: FnOnce(&mut TimerTree) -> R,
{
    with_core(|core| f(&mut core.timers.borrow_mut()))
}

/// Index of the current worker, `None` outside of the runtime.
pub(crate) fn current_worker() -> Option<usize> {
    try_with_context(|ctx| ctx.core.index)
}

pub(crate) fn current_handle() -> Option<Handle> {
    try_with_context(|ctx| ctx.handle.clone())
}

/// Marks `header` as the running task for the duration of a poll.
pub(crate) struct TaskGuard {
    prev: Option<Arc<Header>>,
}

impl TaskGuard {
    pub(crate) fn enter(header: Arc<Header>) -> TaskGuard {
        let prev = CURRENT_TASK.with(|curr| curr.replace(Some(header)));
        TaskGuard { prev }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|curr| *curr.borrow_mut() = self.prev.take());
    }
}

pub(crate) fn current_header() -> Option<Arc<Header>> {
    CURRENT_TASK.with(|curr| curr.borrow().clone())
}

pub(crate) fn current_task_id() -> Option<Id> {
    CURRENT_TASK.with(|curr| curr.borrow().as_ref().map(|header| header.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TaskOpts;
    use crate::test_utils::*;
    use anyhow::Result;
    use std::panic::catch_unwind;

    #[test]
    fn test_no_context_outside_runtime() {
        assert!(!is_worker_thread());
        assert!(current_worker().is_none());
        assert!(current_task_id().is_none());
        assert!(catch_unwind(|| with_core(|_| ())).is_err());
    }

    #[test]
    fn test_context_is_thread_local() -> Result<()> {
        let rt = init_local_runtime()?;

        rt.block_on(async {
            assert_eq!(current_worker(), Some(0));

            let other = std::thread::spawn(is_worker_thread);
            assert!(!other.join().expect("thread panicked"));
        });

        assert!(!is_worker_thread());
        Ok(())
    }

    #[test]
    fn test_nested_enter_panics() -> Result<()> {
        let rt = init_local_runtime()?;

        let res = catch_unwind(std::panic::AssertUnwindSafe(|| {
            rt.block_on(async {
                let inner = init_local_runtime().expect("build inner runtime");
                inner.block_on(async {});
            })
        }));

        assert!(res.is_err());
        Ok(())
    }

    #[test]
    fn test_task_guard_restores_previous() {
        let outer = Arc::new(Header::new(Id::next(), TaskOpts::empty()));
        let inner = Arc::new(Header::new(Id::next(), TaskOpts::empty()));

        let _outer_guard = TaskGuard::enter(Arc::clone(&outer));
        assert_eq!(current_task_id(), Some(outer.id));

        {
            let _inner_guard = TaskGuard::enter(Arc::clone(&inner));
            assert_eq!(current_task_id(), Some(inner.id));
        }

        assert_eq!(current_task_id(), Some(outer.id));
    }
}
