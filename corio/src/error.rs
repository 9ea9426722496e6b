use io_uring::squeue::PushError;
use std::io;

/// Result type used throughout `corio` for fallible runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A centralized error type for every fallible operation of the runtime.
///
/// Cancellation and deadlines are distinct variants so callers can tell an
/// explicit [`CancelSource::cancel`] from an expired timeout. Kernel errors
/// are kept as [`io::Error`] built from the negative `errno` of the completion.
///
/// [`CancelSource::cancel`]: crate::cancel::CancelSource::cancel
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The operation was canceled through its cancellation scope.
    #[error("operation canceled")]
    Canceled,

    /// A deadline elapsed before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A bounded queue had no free slot.
    #[error("queue is full")]
    QueueFull,

    /// The other side of a one-shot channel went away without producing a value.
    #[error("producer dropped without setting a value")]
    Closed,

    /// The submission queue ring for io_uring is full.
    /// This is a recoverable state: completions must be reaped before
    /// submitting more I/O.
    #[error("submission queue ring is full, cannot submit IO")]
    SqRingFull(#[from] PushError),

    /// Every operation slot is in use. Bounded by the size of the CQ ring.
    #[error("operation slab is full, cannot allocate new operation")]
    SlabFull,

    #[error("FATAL: operation slab is in an invalid state")]
    SlabInvalidState,

    #[error("opcode error: {0}")]
    Opcode(#[from] OpcodeError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A catch-all for any other type of unexpected error.
    #[error("an unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

/// Portable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Canceled,
    DeadlineExceeded,
    QueueFull,
    Closed,
    /// Submission back-pressure, see [`Error::is_retryable`].
    Busy,
    Invalid,
    Os(io::ErrorKind),
    Other,
}

impl Error {
    /// Builds an error from the negative result of a kernel completion.
    pub(crate) fn from_errno(res: i32) -> Self {
        Error::Io(io::Error::from_raw_os_error(-res))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Canceled => ErrorKind::Canceled,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::QueueFull => ErrorKind::QueueFull,
            Error::Closed => ErrorKind::Closed,
            Error::SqRingFull(_) | Error::SlabFull => ErrorKind::Busy,
            Error::SlabInvalidState | Error::Opcode(_) => ErrorKind::Invalid,
            Error::Io(e) => ErrorKind::Os(e.kind()),
            Error::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SlabFull => true,
            Error::SqRingFull(_) => true,
            Error::Io(e) => {
                // Rely on kernel errno instead of `io::ErrorKind` for a direct
                // mapping to io_uring documentation.
                e.raw_os_error()
                    .is_some_and(|errno| matches!(errno, libc::EAGAIN | libc::EBUSY))
            }
            _ => false,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::DeadlineExceeded)
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            Error::Opcode(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Canceled, Self::Canceled) => true,
            (Self::DeadlineExceeded, Self::DeadlineExceeded) => true,
            (Self::QueueFull, Self::QueueFull) => true,
            (Self::Closed, Self::Closed) => true,
            (Self::SqRingFull(_), Self::SqRingFull(_)) => true,
            (Self::SlabFull, Self::SlabFull) => true,
            (Self::SlabInvalidState, Self::SlabInvalidState) => true,
            (Self::Opcode(a), Self::Opcode(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => match (a.raw_os_error(), b.raw_os_error()) {
                (Some(x), Some(y)) => x == y,
                _ => a.kind() == b.kind(),
            },
            _ => false,
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io_err) => io_err,
            Error::Canceled => io::Error::new(io::ErrorKind::Interrupted, e),
            Error::DeadlineExceeded => io::Error::new(io::ErrorKind::TimedOut, e),
            Error::QueueFull | Error::SqRingFull(_) | Error::SlabFull => {
                io::Error::new(io::ErrorKind::WouldBlock, e)
            }
            _ => io::Error::other(e.to_string()),
        }
    }
}

/// Errors raised while building a kernel request, before anything is submitted.
#[derive(thiserror::Error, Debug)]
pub enum OpcodeError {
    #[error("buffer of {0} bytes does not fit in a single request")]
    BufferTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl OpcodeError {
    pub(crate) fn raw_os_error(&self) -> Option<i32> {
        match self {
            OpcodeError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl PartialEq for OpcodeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::BufferTooLarge(a), Self::BufferTooLarge(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

/// Returned by non-suspending pushes into a full bounded queue. The rejected
/// value is handed back so it is never silently dropped.
#[derive(thiserror::Error)]
#[error("queue is full")]
pub struct TryPushError<T>(pub T);

impl<T> TryPushError<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TryPushError").finish_non_exhaustive()
    }
}

impl<T> From<TryPushError<T>> for Error {
    fn from(_: TryPushError<T>) -> Self {
        Error::QueueFull
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync);
    assert_impl_all!(TryPushError<u32>: Send, Sync);

    #[rstest]
    #[case::canceled(Error::Canceled, ErrorKind::Canceled, false)]
    #[case::deadline(Error::DeadlineExceeded, ErrorKind::DeadlineExceeded, false)]
    #[case::slab_full(Error::SlabFull, ErrorKind::Busy, true)]
    #[case::eagain(Error::from_errno(-libc::EAGAIN), ErrorKind::Os(io::ErrorKind::WouldBlock), true)]
    #[case::enoent(Error::from_errno(-libc::ENOENT), ErrorKind::Os(io::ErrorKind::NotFound), false)]
    fn test_kind_and_retryable(
        #[case] err: Error,
        #[case] kind: ErrorKind,
        #[case] retryable: bool,
    ) {
        assert_eq!(err.kind(), kind);
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn test_errno_round_trip() {
        let err = Error::from_errno(-libc::ECONNREFUSED);
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));

        let io_err: io::Error = err.into();
        assert_eq!(io_err.raw_os_error(), Some(libc::ECONNREFUSED));
    }

    #[test]
    fn test_cancel_and_deadline_are_distinct() {
        assert_ne!(Error::Canceled, Error::DeadlineExceeded);

        let io_err: io::Error = Error::DeadlineExceeded.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_try_push_error_returns_value() {
        let err = TryPushError(vec![1, 2, 3]);
        assert_eq!(err.into_inner(), vec![1, 2, 3]);
        assert_eq!(Error::from(TryPushError(1)), Error::QueueFull);
    }
}
