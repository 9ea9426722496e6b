//! Synchronization primitives for corio tasks.
//!
//! Every primitive suspends the calling task instead of blocking its worker
//! thread. They are `Send + Sync` and may be shared between tasks running on
//! different workers, or with plain OS threads for the non-suspending
//! operations.
//!
//! - [`Mutex`]: a lock word waited on through the ring's futex operations.
//! - [`Semaphore`]: a counter bounded to `[0, max]`.
//! - [`CondVar`] and [`OnceEvent`]: multi-shot and single-shot notifications.
//! - [`Queue`]: a bounded async queue, built on [`ConcurrentQueue`] and
//!   [`RingQueue`].
//! - [`oneshot`]: a single value-or-error transfer.
//! - [`CallOnce`]: async one-time initialization.

mod call_once;
pub use self::call_once::CallOnce;

mod concurrent_queue;
pub use self::concurrent_queue::ConcurrentQueue;

mod condvar;
pub use self::condvar::{CondVar, Notified, OnceEvent};

mod mutex;
pub use self::mutex::{Mutex, MutexGuard};

pub mod oneshot;
pub use self::oneshot::{FutureSource, FutureToken};

mod queue;
pub use self::queue::{Pop, Push, Queue};

mod ring_queue;
pub use self::ring_queue::RingQueue;

mod semaphore;
pub use self::semaphore::{Semaphore, Wait};

mod wait_list;
