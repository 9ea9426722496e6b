//! Single-shot `io_uring` opcodes.
//!
//! See the [`io_uring` crate documentation](https://docs.rs/io-uring/latest/io_uring/opcode/index.html)
//! for the underlying entries. Every payload owns its buffers and descriptors
//! only through raw fds: closing a descriptor while a request on it is in
//! flight is the caller's responsibility.
use crate::error::{Error, OpcodeError, Result};
use crate::future::OpPayload;
use crate::reactor::Futex2Flags;
use crate::reactor::futex::FUTEX_BITSET_MATCH_ANY;
use io_uring::opcode;
use io_uring::squeue::Entry;
use io_uring::types::{CancelBuilder, Fd, Timespec};
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Maps a negative completion result to an error.
fn check(res: i32) -> Result<u32> {
    if res < 0 {
        Err(Error::from_errno(res))
    } else {
        Ok(res as u32)
    }
}

fn buffer_len(len: usize) -> Result<u32, OpcodeError> {
    u32::try_from(len).map_err(|_| OpcodeError::BufferTooLarge(len))
}

/// Does nothing. Useful to measure the round trip through the ring.
///
/// Corresponds to [`io_uring_prep_nop`](https://man.archlinux.org/man/io_uring_prep_nop.3.en).
#[derive(Debug, Default, Clone, Copy)]
pub struct Nop;

impl OpPayload for Nop {
    type Output = ();

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        Ok(opcode::Nop::new().build())
    }

    fn into_output(self, res: i32) -> Result<()> {
        check(res).map(|_| ())
    }
}

/// Reads up to `len` bytes at `offset`. The returned buffer is truncated to
/// the number of bytes read, empty at end of file.
///
/// Corresponds to [`io_uring_prep_read`](https://man.archlinux.org/man/io_uring_prep_read.3.en).
#[derive(Debug)]
pub struct Read {
    fd: RawFd,
    buf: Vec<u8>,
    offset: u64,
}

impl Read {
    /// Use `u64::MAX` as `offset` to read at the current file position.
    pub fn new(fd: RawFd, len: usize, offset: u64) -> Self {
        Read {
            fd,
            buf: vec![0; len],
            offset,
        }
    }
}

impl OpPayload for Read {
    type Output = Vec<u8>;

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        let len = buffer_len(self.buf.len())?;

        Ok(opcode::Read::new(Fd(self.fd), self.buf.as_mut_ptr(), len)
            .offset(self.offset)
            .build())
    }

    fn into_output(mut self, res: i32) -> Result<Vec<u8>> {
        let n = check(res)? as usize;
        self.buf.truncate(n);
        Ok(self.buf)
    }
}

/// Writes `buf` at `offset`. Returns the number of bytes written.
///
/// Corresponds to [`io_uring_prep_write`](https://man.archlinux.org/man/io_uring_prep_write.3.en).
#[derive(Debug)]
pub struct Write {
    fd: RawFd,
    buf: Vec<u8>,
    offset: u64,
}

impl Write {
    /// Use `u64::MAX` as `offset` to write at the current file position.
    pub fn new(fd: RawFd, buf: impl Into<Vec<u8>>, offset: u64) -> Self {
        Write {
            fd,
            buf: buf.into(),
            offset,
        }
    }
}

impl OpPayload for Write {
    type Output = usize;

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        let len = buffer_len(self.buf.len())?;

        Ok(opcode::Write::new(Fd(self.fd), self.buf.as_ptr(), len)
            .offset(self.offset)
            .build())
    }

    fn into_output(self, res: i32) -> Result<usize> {
        check(res).map(|n| n as usize)
    }
}

/// Accepts a connection on a listening socket. The new descriptor is
/// created with `SOCK_CLOEXEC`.
///
/// Corresponds to [`io_uring_prep_accept`](https://man.archlinux.org/man/io_uring_prep_accept.3.en).
#[derive(Debug)]
pub struct Accept {
    fd: RawFd,
}

impl Accept {
    pub fn new(fd: RawFd) -> Self {
        Accept { fd }
    }
}

impl OpPayload for Accept {
    type Output = OwnedFd;

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        Ok(
            opcode::Accept::new(Fd(self.fd), std::ptr::null_mut(), std::ptr::null_mut())
                .flags(libc::SOCK_CLOEXEC)
                .build(),
        )
    }

    fn into_output(self, res: i32) -> Result<OwnedFd> {
        let fd = check(res)? as RawFd;

        // Safety: the kernel just created this descriptor for us.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

/// Connects a socket to `addr`.
///
/// Corresponds to [`io_uring_prep_connect`](https://man.archlinux.org/man/io_uring_prep_connect.3.en).
#[derive(Debug)]
pub struct Connect {
    fd: RawFd,
    addr: SockaddrStorage,
}

impl Connect {
    pub fn new(fd: RawFd, addr: SocketAddr) -> Self {
        Connect {
            fd,
            addr: SockaddrStorage::from(addr),
        }
    }
}

impl OpPayload for Connect {
    type Output = ();

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        Ok(opcode::Connect::new(Fd(self.fd), self.addr.as_ptr(), self.addr.len()).build())
    }

    fn into_output(self, res: i32) -> Result<()> {
        check(res).map(|_| ())
    }
}

/// Closes a descriptor.
///
/// Corresponds to [`io_uring_prep_close`](https://man.archlinux.org/man/io_uring_prep_close.3.en).
#[derive(Debug)]
pub struct Close {
    fd: RawFd,
}

impl Close {
    pub fn new(fd: OwnedFd) -> Self {
        Close {
            fd: fd.into_raw_fd(),
        }
    }
}

impl OpPayload for Close {
    type Output = ();

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        Ok(opcode::Close::new(Fd(self.fd)).build())
    }

    fn into_output(self, res: i32) -> Result<()> {
        check(res).map(|_| ())
    }
}

/// Completes after `duration`. Expiry is success.
///
/// Corresponds to [`io_uring_prep_timeout`](https://man.archlinux.org/man/io_uring_prep_timeout.3.en).
#[derive(Debug)]
pub struct Timeout {
    ts: Timespec,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Timeout {
            ts: Timespec::from(duration),
        }
    }
}

impl OpPayload for Timeout {
    type Output = ();

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        Ok(opcode::Timeout::new(&self.ts as *const Timespec).build())
    }

    fn into_output(self, res: i32) -> Result<()> {
        match res {
            res if res == -libc::ETIME => Ok(()),
            res => check(res).map(|_| ()),
        }
    }
}

/// Cancels every in-flight request on a descriptor. Returns how many were
/// found, zero when there was nothing to cancel.
///
/// Corresponds to [`io_uring_prep_cancel_fd`](https://man.archlinux.org/man/io_uring_prep_cancel_fd.3.en).
#[derive(Debug)]
pub struct AsyncCancel {
    fd: RawFd,
}

impl AsyncCancel {
    pub fn fd(fd: RawFd) -> Self {
        AsyncCancel { fd }
    }
}

impl OpPayload for AsyncCancel {
    type Output = usize;

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        Ok(opcode::AsyncCancel2::new(CancelBuilder::fd(Fd(self.fd)).all()).build())
    }

    fn into_output(self, res: i32) -> Result<usize> {
        match res {
            res if res == -libc::ENOENT => Ok(0),
            res => check(res).map(|n| n as usize),
        }
    }
}

/// Waits while `word` holds `expected`.
///
/// Completes right away when the value already changed, the caller is
/// expected to re-check the word in a loop.
///
/// Corresponds to [`io_uring_prep_futex_wait`](https://man.archlinux.org/man/io_uring_prep_futex_wait.3.en).
#[derive(Debug)]
pub struct FutexWait {
    word: Arc<AtomicU32>,
    expected: u32,
}

impl FutexWait {
    pub fn new(word: Arc<AtomicU32>, expected: u32) -> Self {
        FutexWait { word, expected }
    }
}

impl OpPayload for FutexWait {
    type Output = ();

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        Ok(opcode::FutexWait::new(
            self.word.as_ptr().cast_const(),
            self.expected as u64,
            FUTEX_BITSET_MATCH_ANY,
            Futex2Flags::private_u32().bits(),
        )
        .build())
    }

    fn into_output(self, res: i32) -> Result<()> {
        match res {
            // The word no longer holds `expected`.
            res if res == -libc::EAGAIN => Ok(()),
            res => check(res).map(|_| ()),
        }
    }
}

/// Wakes up to `count` waiters of `word`. Returns how many were woken.
///
/// Corresponds to [`io_uring_prep_futex_wake`](https://man.archlinux.org/man/io_uring_prep_futex_wake.3.en).
#[derive(Debug)]
pub struct FutexWake {
    word: Arc<AtomicU32>,
    count: u32,
}

impl FutexWake {
    pub fn new(word: Arc<AtomicU32>, count: u32) -> Self {
        FutexWake { word, count }
    }
}

impl OpPayload for FutexWake {
    type Output = usize;

    fn create_entry(&mut self) -> Result<Entry, OpcodeError> {
        Ok(opcode::FutexWake::new(
            self.word.as_ptr().cast_const(),
            self.count as u64,
            FUTEX_BITSET_MATCH_ANY,
            Futex2Flags::private_u32().bits(),
        )
        .build())
    }

    fn into_output(self, res: i32) -> Result<usize> {
        check(res).map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corio;
    use crate::future::Op;
    use crate::task::JoinHandle;
    use anyhow::Result;
    use rstest::rstest;
    use std::io::Write as _;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    #[corio::test]
    async fn test_read_write_file() -> Result<()> {
        let file = tempfile::tempfile()?;
        let fd = file.as_raw_fd();

        let written = Op::new(Write::new(fd, b"hello corio".to_vec(), 0)).await?;
        assert_eq!(written, 11);

        let buf = Op::new(Read::new(fd, 64, 0)).await?;
        assert_eq!(buf, b"hello corio");

        let buf = Op::new(Read::new(fd, 5, 6)).await?;
        assert_eq!(buf, b"corio");
        Ok(())
    }

    #[rstest]
    #[case::start(0, b"abcdef".as_slice())]
    #[case::middle(3, b"def".as_slice())]
    #[case::eof(6, b"".as_slice())]
    #[corio::test]
    async fn test_read_offsets(#[case] offset: u64, #[case] expected: &[u8]) -> Result<()> {
        let mut file = tempfile::tempfile()?;
        file.write_all(b"abcdef")?;

        let buf = Op::new(Read::new(file.as_raw_fd(), 16, offset)).await?;
        assert_eq!(buf, expected);
        Ok(())
    }

    #[corio::test]
    async fn test_read_bad_fd() -> Result<()> {
        let err = Op::new(Read::new(-1, 16, 0))
            .await
            .expect_err("reading fd -1 must fail");

        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        Ok(())
    }

    #[corio::test]
    async fn test_accept_connect() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;

        let accept = corio::spawn({
            let fd = listener.as_raw_fd();
            async move { Op::new(Accept::new(fd)).await }
        });

        let socket = unconnected_stream(&addr)?;
        Op::new(Connect::new(socket.as_raw_fd(), addr)).await?;

        let accepted = accept.await??;
        let accepted = TcpStream::from(accepted);
        assert_eq!(accepted.local_addr()?, addr);

        Op::new(Close::new(OwnedFd::from(accepted))).await?;
        drop(listener);
        Ok(())
    }

    /// A TCP socket that is not connected yet.
    fn unconnected_stream(addr: &SocketAddr) -> Result<OwnedFd> {
        use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};

        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };

        Ok(socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?)
    }

    #[corio::test]
    async fn test_timeout_expiry_is_success() -> Result<()> {
        let start = Instant::now();
        Op::new(Timeout::new(Duration::from_millis(2))).await?;
        assert!(start.elapsed() >= Duration::from_millis(2));
        Ok(())
    }

    #[corio::test]
    async fn test_async_cancel_nothing_in_flight() -> Result<()> {
        let file = tempfile::tempfile()?;
        assert_eq!(Op::new(AsyncCancel::fd(file.as_raw_fd())).await?, 0);
        Ok(())
    }

    #[corio::test]
    async fn test_futex_wait_value_changed() -> Result<()> {
        let word = Arc::new(AtomicU32::new(1));

        // Expected value is stale: completes right away.
        Op::new(FutexWait::new(Arc::clone(&word), 0)).await?;
        Ok(())
    }

    #[corio::test(flavor = "stealing", worker_threads = 2)]
    async fn test_futex_wait_wake() -> Result<()> {
        let word = Arc::new(AtomicU32::new(0));

        let waiter: JoinHandle<corio::Result<()>> = corio::spawn({
            let word = Arc::clone(&word);
            async move {
                while word.load(Ordering::Acquire) == 0 {
                    Op::new(FutexWait::new(Arc::clone(&word), 0)).await?;
                }
                corio::Result::Ok(())
            }
        });

        corio::time::sleep(Duration::from_millis(5)).await;

        word.store(1, Ordering::Release);
        Op::new(FutexWake::new(Arc::clone(&word), u32::MAX)).await?;

        waiter.await??;
        Ok(())
    }
}
