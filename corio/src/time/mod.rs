//! Utilities for tracking time.
//!
//! Timers live on the worker that armed them, in an ordered [`TimerTree`].
//! The worker fires due timers at the start of every compute phase and bounds
//! its blocking wait by the next deadline.
mod sleep;
pub use self::sleep::{Sleep, sleep, sleep_cancellable, sleep_until};

mod timer;
pub(crate) use self::timer::{TimerKey, TimerTree};

mod yield_now;
pub use self::yield_now::{YieldNow, yield_now};
