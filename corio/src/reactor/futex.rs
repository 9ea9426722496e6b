use bitflags::bitflags;
use std::io;
use std::sync::atomic::AtomicU32;

/// Wake every waiter whose bitset intersects this mask.
pub(crate) const FUTEX_BITSET_MATCH_ANY: u64 = u32::MAX as u64;

bitflags! {
    /// `futex2` flags understood by `IORING_OP_FUTEX_WAIT` / `IORING_OP_FUTEX_WAKE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Futex2Flags: u32 {
        const SIZE_U32 = 0x02;
        const PRIVATE = 128;
    }
}

impl Futex2Flags {
    /// Process-private 32-bit futex, the only kind the runtime uses.
    pub(crate) fn private_u32() -> Self {
        Futex2Flags::SIZE_U32 | Futex2Flags::PRIVATE
    }
}

/// Wakes up to `count` waiters blocked on `word`, from any thread.
///
/// Uses the `futex(2)` syscall directly: waiters armed through io_uring are
/// woken the same way as threads blocked in the syscall. Returns the number of
/// waiters woken.
pub(crate) fn futex_wake(word: &AtomicU32, count: u32) -> io::Result<usize> {
    // Safety: `word` is a valid, aligned u32 for the duration of the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count.min(i32::MAX as u32) as libc::c_int,
        )
    };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Blocks the calling OS thread while `word == expected`, or until `timeout`.
/// Only used by threads that do not run an event loop.
pub(crate) fn futex_wait(
    word: &AtomicU32,
    expected: u32,
    timeout: Option<std::time::Duration>,
) -> io::Result<()> {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

    // Safety: `word` and `ts` outlive the syscall.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        )
    };

    if ret < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ETIMEDOUT) => Ok(()),
            _ => Err(err),
        }
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wake_without_waiters() -> io::Result<()> {
        let word = AtomicU32::new(0);
        assert_eq!(futex_wake(&word, 1)?, 0);
        Ok(())
    }

    #[test]
    fn test_wait_value_mismatch_returns() -> io::Result<()> {
        let word = AtomicU32::new(1);
        futex_wait(&word, 0, None)
    }

    #[test]
    fn test_cross_thread_wake() -> io::Result<()> {
        let word = Arc::new(AtomicU32::new(0));

        let waiter = {
            let word = Arc::clone(&word);
            thread::spawn(move || -> io::Result<()> {
                while word.load(Ordering::Acquire) == 0 {
                    futex_wait(&word, 0, Some(Duration::from_millis(100)))?;
                }
                Ok(())
            })
        };

        word.store(1, Ordering::Release);
        futex_wake(&word, 1)?;

        waiter.join().expect("waiter panicked")
    }
}
