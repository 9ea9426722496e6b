//! A thread-per-core async runtime on top of io_uring.
//!
//! Every worker owns a ring, a FIFO ready queue and a timer tree. Kernel
//! requests are submitted through [`future::Op`], timers through
//! [`time::sleep`], and tasks synchronize with the primitives of [`sync`],
//! all of which suspend the task rather than the worker thread.
//!
//! Cancellation is cooperative: operations registered under a
//! [`cancel::CancelToken`] are unblocked when its source is canceled, and the
//! canceling side waits until every one of them acknowledged.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! #[corio::main]
//! async fn main() -> corio::Result<()> {
//!     let handle = corio::spawn(async {
//!         corio::time::sleep(Duration::from_millis(10)).await;
//!         "done"
//!     });
//!
//!     let value = corio::combinator::timeout(Duration::from_secs(1), handle).await?;
//!     assert_eq!(value.unwrap(), "done");
//!     Ok(())
//! }
//! ```

#[doc(inline)]
pub use corio_macros::main;

#[doc(inline)]
pub use corio_macros::test;

pub mod blocking;

pub mod cancel;

pub mod combinator;

mod context;

mod error;
pub use error::{Error, ErrorKind, OpcodeError, Result, TryPushError};

pub mod future;

mod reactor;

pub mod runtime;
pub use runtime::{TaskOpts, spawn, spawn_builder, spawn_detached, spawn_mt};

pub mod sync;

pub mod task;
pub use task::join;

pub mod time;

mod utils;

#[cfg(test)]
mod test_utils;
