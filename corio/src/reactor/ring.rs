use crate::error::Error;
use crate::runtime::RuntimeConfig;
use anyhow::{Context, Result};
use io_uring::squeue::Entry;
use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{CompletionQueue, EnterFlags, IoUring, SubmissionQueue};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// A wrapper around `io_uring` specifically configured for a Single Issuer.
///
/// This implementation leverages `IORING_SETUP_SINGLE_ISSUER` and `IORING_SETUP_DEFER_TASKRUN`.
/// This combination allows the kernel to defer processing completions until `io_uring_enter`
/// is explicitly called, minimizing interrupt overhead and context switches.
pub(crate) struct SingleIssuerRing {
    ring: IoUring,
}

impl SingleIssuerRing {
    pub(crate) fn try_new(cfg: &RuntimeConfig) -> Result<Self> {
        let cq_size = (cfg.sq_ring_size * cfg.cq_ring_size_multiplier) as u32;

        let ring = IoUring::builder()
            // Keep submitting requests even if one of them fails, every SQE
            // produces a CQE and error handling belongs to the operation.
            .setup_submit_all()
            // Hint kernel that a single thread will submit requests
            .setup_single_issuer()
            // Only run completion `task_work` when we call `io_uring_enter`
            // with GETEVENTS, never as a side effect of unrelated syscalls.
            .setup_defer_taskrun()
            // Handle completions ourselves prevent unwanted interrupts
            .setup_coop_taskrun()
            // Setup IORING_SQ_TASKRUN flag on SQ ring to indicate if completions
            // are pending w/o a syscall to `io_uring_enter`
            .setup_taskrun_flag()
            .setup_cqsize(cq_size)
            .build(cfg.sq_ring_size as u32)
            .context("failed to create io_uring instance")?;

        if !ring.params().is_feature_nodrop() {
            tracing::warn!(
                "IORING_FEAT_NODROP is not supported by this kernel, completions are dropped when the CQ ring is full"
            );
        }

        Ok(SingleIssuerRing { ring })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    pub(crate) fn sq(&mut self) -> SubmissionQueue<'_> {
        self.ring.submission()
    }

    pub(crate) fn cq(&mut self) -> CompletionQueue<'_> {
        self.ring.completion()
    }

    pub(crate) fn num_unsubmitted_sqes(&mut self) -> usize {
        self.sq().len()
    }

    pub(crate) fn push(&mut self, entry: &Entry) -> Result<(), Error> {
        // Safety: every entry references memory owned by an `Operation` record
        // (or by the caller) that outlives the request.
        unsafe { self.sq().push(entry).map_err(Error::from) }
    }

    pub(crate) fn push_batch(&mut self, entries: &[Entry]) -> Result<(), Error> {
        // Safety: see `push`.
        unsafe { self.sq().push_multiple(entries).map_err(Error::from) }
    }

    pub(crate) fn submit_and_wait(
        &mut self,
        num_to_wait: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        // Sync user space and kernel shared queue
        self.ring.submission().sync();

        if let Some(duration) = timeout {
            let ts = Timespec::from(duration);
            let args = SubmitArgs::new().timespec(&ts);

            return match self.ring.submitter().submit_with_args(num_to_wait, &args) {
                Ok(n) => Ok(n),

                // A bounded wait that saw no completion is not an error.
                Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(0),

                // Interrupted by a signal, the caller loops anyway.
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(0),

                Err(e) => Err(e),
            };
        }

        match self.ring.submitter().submit_and_wait(num_to_wait) {
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(0),
            res => res,
        }
    }

    /// Submit all pending SQEs without the GETEVENTS flag, so the kernel does
    /// not run the deferred `task_work` of previous requests on this call.
    pub(crate) fn submit_no_wait(&mut self) -> io::Result<usize> {
        let to_submit = {
            let mut sq = self.sq();
            sq.sync();
            sq.len()
        };

        if to_submit == 0 {
            return Ok(0);
        }

        // Safety: no signal mask is passed.
        unsafe {
            self.ring.submitter().enter::<libc::sigset_t>(
                to_submit as u32,
                0,
                EnterFlags::empty().bits(),
                None,
            )
        }
    }

    /// Runs deferred `task_work` without blocking, posting every completion
    /// the kernel already has for us.
    pub(crate) fn run_task_work(&mut self) -> io::Result<usize> {
        self.submit_and_wait(1, Some(Duration::ZERO))
    }

    /// Because we set IORING_SETUP_TASKRUN_FLAG, we have a shortcut to check
    /// if completions are pending without a syscall.
    pub(crate) fn has_ready_cqes(&mut self) -> bool {
        self.sq().taskrun() || !self.cq().is_empty()
    }

    /// Visit every CQE currently in the completion ring.
    pub(crate) fn drain_cqes<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(u64, i32),
    {
        let mut num_visited = 0;
        let mut cq = self.cq();
        cq.sync();

        for cqe in &mut cq {
            num_visited += 1;
            f(cqe.user_data(), cqe.result());
        }

        num_visited
    }
}

impl std::fmt::Debug for SingleIssuerRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleIssuerRing")
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}
