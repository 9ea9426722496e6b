//! Cooperative, acknowledgment-based cancellation.
//!
//! A [`CancelSource`] owns a cancellation scope: a flag plus the registry of
//! operations currently running under it. Operations join the scope through
//! a [`CancelToken`], usually with [`CancelToken::guard`].
//!
//! Canceling is a request followed by a wait: [`CancelSource::cancel`] sets
//! the flag, wakes every registered operation so it can unblock itself, and
//! resolves only once each of them acknowledged, either by completing with
//! its canceled value or by completing naturally first.
//!
//! ```no_run
//! use corio::cancel::CancelSource;
//! use std::time::Duration;
//!
//! # #[corio::main]
//! # async fn main() {
//! let source = CancelSource::new();
//! let token = source.token();
//!
//! let handle = corio::spawn(async move { token.cancelled().await });
//! corio::time::sleep(Duration::from_millis(1)).await;
//!
//! source.cancel().await;
//! assert!(handle.is_finished());
//! # }
//! ```
use std::pin::Pin;
use std::task::{Context, Poll};

mod guard;
pub use self::guard::{Abortable, Cancelled, Guarded};

mod source;
pub use self::source::{Cancel, CancelSource, CancelToken};

/// Describes how a specific kind of suspension takes part in cancellation.
///
/// The [`Guarded`] wrapper drives the adaptor: [`poll_run`] while the scope
/// is live, [`poll_cancel`] once it was canceled, until one of them is ready.
///
/// [`poll_run`]: CancelAdaptor::poll_run
/// [`poll_cancel`]: CancelAdaptor::poll_cancel
pub trait CancelAdaptor {
    type Output;

    /// Makes progress on the operation, like [`Future::poll`].
    fn poll_run(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output>;

    /// Unblocks the suspension after the scope was canceled.
    ///
    /// May complete with the natural result when the operation finished
    /// before it observed the cancellation.
    fn poll_cancel(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output>;

    /// Value produced when the scope was canceled before the operation started.
    fn early_canceled(self: Pin<&mut Self>) -> Self::Output;
}

#[cfg(test)]
mod tests;
