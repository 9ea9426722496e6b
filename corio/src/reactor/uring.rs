use crate::error::{Error, Result};
use crate::reactor::futex::{FUTEX_BITSET_MATCH_ANY, Futex2Flags};
use crate::reactor::operation::{CompletionEffect, Operation, OperationState};
use crate::reactor::ring::SingleIssuerRing;
use crate::reactor::slab::OperationSlab;
use crate::reactor::{Keepalive, OpHandle, Reactor};
use crate::runtime::RuntimeConfig;
use io_uring::opcode;
use io_uring::squeue::{Entry, Flags};
use io_uring::types::{CancelBuilder, Timespec};
use std::sync::atomic::AtomicU32;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

/// `user_data` of the worker wake-up futex wait. Never a valid slab index.
const WAKE_TOKEN: u64 = u64::MAX;

/// [`Reactor`] backed by a single-issuer io_uring instance.
#[derive(Debug)]
pub(crate) struct UringReactor {
    ring: SingleIssuerRing,
    slab: OperationSlab,
    wake_armed: bool,
    futex_supported: bool,
}

impl UringReactor {
    pub(crate) fn try_new(cfg: &RuntimeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            ring: SingleIssuerRing::try_new(cfg)?,
            slab: OperationSlab::new(cfg.sq_ring_size * cfg.cq_ring_size_multiplier),
            wake_armed: false,
            futex_supported: true,
        })
    }

    fn reap(&mut self, woken: &mut Vec<Waker>) -> usize {
        let slab = &mut self.slab;
        let wake_armed = &mut self.wake_armed;
        let futex_supported = &mut self.futex_supported;

        self.ring.drain_cqes(|user_data, res| {
            if user_data == WAKE_TOKEN {
                *wake_armed = false;
                if matches!(-res, libc::EINVAL | libc::EOPNOTSUPP | libc::ENOSYS) {
                    tracing::warn!(
                        res,
                        "io_uring futex wait unsupported, falling back to bounded parking"
                    );
                    *futex_supported = false;
                }
                return;
            }

            let key = user_data as usize;
            let Some(op) = slab.get_mut(key).ok() else {
                tracing::warn!(user_data, res, "completion for unknown operation");
                return;
            };

            match op.on_completion(res) {
                CompletionEffect::Wake(Some(waker)) => woken.push(waker),
                CompletionEffect::Wake(None) => {}
                CompletionEffect::Release => {
                    slab.remove(key);
                }
            }
        })
    }
}

/// Pushes to the SQ ring, flushing it once if it is full.
fn push_or_flush(ring: &mut SingleIssuerRing, entry: &Entry) -> Result<()> {
    match ring.push(entry) {
        Err(Error::SqRingFull(_)) => {
            ring.submit_no_wait()?;
            ring.push(entry)
        }
        res => res,
    }
}

impl Reactor for UringReactor {
    fn submit(&mut self, entry: Entry, waker: &Waker) -> Result<OpHandle> {
        let reserved = self.slab.reserve_entry()?;
        let key = reserved.key();

        push_or_flush(&mut self.ring, &entry.user_data(key as u64))?;
        reserved.commit(Operation::new(waker));
        Ok(OpHandle(key))
    }

    fn submit_with_deadline(
        &mut self,
        entry: Entry,
        deadline: Duration,
        waker: &Waker,
    ) -> Result<OpHandle> {
        let ts: Box<Timespec> = Box::new(Timespec::from(deadline));

        // Both SQEs must land in the ring together for the link to hold.
        let capacity = self.ring.sq().capacity();
        if capacity - self.ring.num_unsubmitted_sqes() < 2 {
            self.ring.submit_no_wait()?;
        }

        let batch = self.slab.reserve_batch(2)?;
        let (op_key, timeout_key) = (batch.keys()[0], batch.keys()[1]);

        let entries = [
            entry.flags(Flags::IO_LINK).user_data(op_key as u64),
            opcode::LinkTimeout::new(&*ts as *const Timespec)
                .build()
                .user_data(timeout_key as u64),
        ];
        self.ring.push_batch(&entries)?;

        batch.commit([Operation::new(waker), Operation::detached(Some(ts))].into_iter())?;
        Ok(OpHandle(op_key))
    }

    fn submit_detached(&mut self, entry: Entry, keepalive: Option<Keepalive>) -> Result<()> {
        let reserved = self.slab.reserve_entry()?;
        let key = reserved.key();

        push_or_flush(&mut self.ring, &entry.user_data(key as u64))?;
        reserved.commit(Operation::detached(keepalive));
        Ok(())
    }

    fn poll_op(&mut self, handle: OpHandle, waker: &Waker) -> Poll<Result<i32>> {
        let op = match self.slab.get_mut(handle.0) {
            Ok(op) => op,
            Err(e) => return Poll::Ready(Err(e)),
        };

        match op.state {
            OperationState::Completed(res) => {
                self.slab.remove(handle.0);
                Poll::Ready(Ok(res))
            }
            OperationState::Submitted => {
                op.set_waker(waker);
                Poll::Pending
            }
            OperationState::Orphaned => Poll::Ready(Err(Error::SlabInvalidState)),
        }
    }

    fn cancel(&mut self, handle: OpHandle) -> Result<()> {
        let entry = opcode::AsyncCancel2::new(CancelBuilder::user_data(handle.user_data())).build();
        self.submit_detached(entry, None)
    }

    fn orphan(&mut self, handle: OpHandle, keepalive: Option<Keepalive>) {
        let Ok(op) = self.slab.get_mut(handle.0) else {
            return;
        };

        if let OperationState::Completed(_) = op.state {
            self.slab.remove(handle.0);
        } else {
            tracing::debug!(user_data = handle.user_data(), "orphaning in-flight operation");
            op.orphan(keepalive);
        }
    }

    fn flush(&mut self) -> Result<usize> {
        Ok(self.ring.submit_no_wait()?)
    }

    fn poll_completions(&mut self, woken: &mut Vec<Waker>) -> Result<usize> {
        if self.ring.has_ready_cqes() {
            self.ring.run_task_work()?;
        }

        Ok(self.reap(woken))
    }

    fn wait(&mut self, timeout: Option<Duration>, woken: &mut Vec<Waker>) -> Result<usize> {
        self.ring.submit_and_wait(1, timeout)?;
        Ok(self.reap(woken))
    }

    fn arm_wakeup(&mut self, word: &AtomicU32, seen: u32) -> Result<bool> {
        if !self.futex_supported {
            return Ok(false);
        }

        if !self.wake_armed {
            let entry = opcode::FutexWait::new(
                word.as_ptr().cast_const(),
                seen as u64,
                FUTEX_BITSET_MATCH_ANY,
                Futex2Flags::private_u32().bits(),
            )
            .build()
            .user_data(WAKE_TOKEN);

            push_or_flush(&mut self.ring, &entry)?;
            self.wake_armed = true;
        }

        Ok(true)
    }

    fn has_ready(&mut self) -> bool {
        self.ring.has_ready_cqes()
    }

    fn num_unsubmitted(&mut self) -> usize {
        self.ring.num_unsubmitted_sqes()
    }

    fn in_flight(&self) -> usize {
        self.slab.len()
    }

    fn shutdown(&mut self, timeout: Duration) {
        let entry = opcode::AsyncCancel2::new(CancelBuilder::any()).build();
        if let Err(e) = self.submit_detached(entry, None) {
            tracing::warn!("failed to cancel in-flight operations on shutdown: {}", e);
        }

        let deadline = Instant::now() + timeout;
        let mut woken = Vec::new();

        while (!self.slab.is_empty() || self.wake_armed) && Instant::now() < deadline {
            if let Err(e) = self.wait(Some(Duration::from_millis(10)), &mut woken) {
                tracing::warn!("error while draining reactor: {}", e);
                break;
            }
        }

        // Wakers belong to tasks that are being torn down, nothing to resume.
        drop(woken);

        if !self.slab.is_empty() {
            tracing::warn!(
                leaked = self.slab.len(),
                "kernel still owns operation memory after shutdown, leaking it"
            );
            for op in self.slab.drain() {
                std::mem::forget(op);
            }
        }
    }
}
