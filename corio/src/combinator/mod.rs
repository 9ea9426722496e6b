//! Combinators composing futures on a single task.
//!
//! The sub-futures are polled by the task awaiting the combinator, so they
//! interleave cooperatively on one worker. Spawn them and combine their
//! [`JoinHandle`](crate::task::JoinHandle)s to run them in parallel.

mod group;
pub use self::group::TaskGroup;

mod timeout;
pub use self::timeout::{Timeout, timeout, timeout_at, timeout_with};

mod when_all;
pub use self::when_all::{WhenAll, try_when_all, when_all, when_all2};

mod when_any;
pub use self::when_any::{Tagged, WhenAny, when_any, when_any_cancel, when_any2};

pub use either::Either;
