//! Bridge to run blocking code off the runtime workers.
//!
//! A blocking job runs on a dedicated OS thread of the runtime's
//! [`ThreadPool`]. The task awaiting it is suspended and stays on its worker
//! until the job returns, so its resumption comes back to the scheduler it
//! started on.

mod pool;
pub use self::pool::ThreadPool;

mod handle;
pub use self::handle::{BlockingHandle, StopFlag};
pub(crate) use self::handle::{spawn_deferred, spawn_on};

use crate::cancel::{CancelToken, Guarded};
use crate::runtime::Handle;

/// Runs `f` on the blocking thread pool and returns a future resolving to its
/// output.
///
/// If `f` panics, the panic is resumed in the task awaiting the handle.
/// Dropping the handle does not stop `f`.
///
/// # Panics
///
/// Panics when called outside of a runtime worker. Use
/// [`Handle::spawn_blocking`] from other threads.
///
/// ```no_run
/// # #[corio::main]
/// # async fn main() -> corio::Result<()> {
/// let contents = corio::blocking::spawn_blocking(|| std::fs::read_to_string("/etc/hostname")).await?;
/// # Ok(())
/// # }
/// ```
#[track_caller]
pub fn spawn_blocking<F, T>(f: F) -> BlockingHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_on(&Handle::current(), |_| f())
}

/// Like [`spawn_blocking`], for jobs that poll a [`StopFlag`].
///
/// The job is submitted when the returned future is first polled, so a
/// token canceled before that keeps `f` from ever running. Canceling a
/// running job raises the flag and waits for `f` to return, the result is
/// then [`Error::Canceled`](crate::Error::Canceled). The job is never
/// interrupted: a job that ignores the flag runs to completion. A job that
/// returned before the cancellation keeps its output.
#[track_caller]
pub fn spawn_blocking_cancellable<F, T>(token: &CancelToken, f: F) -> Guarded<BlockingHandle<T>>
where
    F: FnOnce(StopFlag) -> T + Send + 'static,
    T: Send + 'static,
{
    token.guard(spawn_deferred(&Handle::current(), f))
}
