use crate::context::{Context, Core, Shared};
use crate::runtime::Handle;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::task::Task;
use anyhow::Result;
use crossbeam_deque::Steal;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{self, Poll, Wake, Waker};
use std::time::{Duration, Instant};

/// Park timeout cap when the kernel cannot interrupt a wait with a futex
/// wake: foreign wakes are then only noticed on timeout.
const UNSUPPORTED_FUTEX_PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// Event loop of one worker.
///
/// Each pass runs, in order:
/// 1. compute: fire due timers and drain the ready queue,
/// 2. event: reap completions without blocking, back to 1. if any,
/// 3. steal: the global queue, then peers' ready queues,
/// 4. park: block in the reactor, bounded by the next timer.
pub(crate) struct Worker {
    index: usize,

    shared: Arc<Shared>,

    ticker: Ticker,

    policy: EventLoopPolicy,

    /// Other workers in a per-worker random order, to spread contention when
    /// everybody is looking for work at once.
    peers: Vec<usize>,

    /// Grows while the worker stays idle, reset when it finds work.
    park_timeout: Duration,

    /// Wakers collected from the reactor and the timers. They are only woken
    /// once the borrow of the structure they came from is released.
    woken: Vec<Waker>,
}

impl Worker {
    pub(crate) fn new(handle: &Handle, index: usize) -> Self {
        let shared = Arc::clone(&handle.shared);

        let mut peers = (0..shared.num_workers())
            .filter(|&i| i != index)
            .collect::<Vec<_>>();
        fastrand::shuffle(&mut peers);

        Worker {
            index,
            ticker: Ticker::new(),
            policy: EventLoopPolicy::from(&*shared),
            park_timeout: shared.cfg.park_timeout_min,
            peers,
            woken: Vec::with_capacity(shared.cfg.sq_ring_size),
            shared,
        }
    }

    /// Runs until `root` completes, or until shutdown when there is no root
    /// future.
    pub(crate) fn run<F: Future>(
        &mut self,
        ctx: &Context,
        mut root: Option<Pin<&mut F>>,
    ) -> Result<Option<F::Output>> {
        let root_waker = Arc::new(RootWaker::new(Arc::clone(&self.shared), self.index));
        let waker = Waker::from(Arc::clone(&root_waker));
        let mut cx = task::Context::from_waker(&waker);

        tracing::debug!(worker = self.index, "worker started");

        loop {
            if let Some(fut) = root.as_mut()
                && root_waker.take_woken()
                && let Poll::Ready(output) = fut.as_mut().poll(&mut cx)
            {
                return Ok(Some(output));
            }

            if self.shared.is_shutdown() {
                break;
            }

            let polled = self.run_ready(ctx, &root_waker)?;

            if self.poll_events(&ctx.core)? > 0 || polled > 0 {
                self.park_timeout = self.shared.cfg.park_timeout_min;
                continue;
            }

            if root_waker.is_woken() {
                continue;
            }

            if self.steal(&ctx.core) {
                self.park_timeout = self.shared.cfg.park_timeout_min;
                continue;
            }

            self.park(&ctx.core, &root_waker)?;
        }

        tracing::debug!(worker = self.index, "worker stopped");
        Ok(None)
    }

    /// Compute phase. Returns the number of tasks polled.
    fn run_ready(&mut self, ctx: &Context, root: &RootWaker) -> Result<usize> {
        let core = &ctx.core;
        let mut polled = 0;

        self.fire_timers(core);
        self.drain_inbox(core);

        loop {
            let events = self.ticker.tick(ctx, &mut self.policy);

            if events.contains(TickerEvents::SHUTDOWN) {
                break;
            }

            // Because we use `DEFER_TASKRUN`, completions only get posted when
            // we enter the kernel, a busy ready queue must not starve them.
            if events.contains(TickerEvents::PROCESS_CQES) {
                self.poll_events(core)?;
            } else if events.contains(TickerEvents::SUBMIT_SQES) {
                core.reactor.borrow_mut().flush()?;
            }

            if events.contains(TickerEvents::FIRE_TIMERS) {
                self.fire_timers(core);
                self.drain_inbox(core);
            }

            let task = if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
                self.pop_global(core).or_else(|| core.run_queue.pop())
            } else {
                core.run_queue.pop().or_else(|| self.pop_global(core))
            };

            let Some(task) = task else {
                break;
            };

            task.header().set_owner(self.index);
            task.run();
            polled += 1;

            if root.is_woken() {
                break;
            }
        }

        Ok(polled)
    }

    fn pop_global(&self, core: &Core) -> Option<Task> {
        self.shared
            .injector
            .steal_batch_and_pop(&core.run_queue)
            .success()
    }

    fn drain_inbox(&self, core: &Core) {
        let remote = &self.shared.remotes[self.index];

        if remote.has_inbox() {
            remote
                .take_inbox()
                .into_iter()
                .for_each(|task| core.run_queue.push(task));
        }
    }

    fn fire_timers(&mut self, core: &Core) {
        let fired = core
            .timers
            .borrow_mut()
            .fire_due(Instant::now(), &mut self.woken);

        if fired > 0 {
            self.wake_pending();
        }
    }

    /// Event phase: submits pending requests and reaps what the kernel
    /// already completed, without blocking.
    fn poll_events(&mut self, core: &Core) -> Result<usize> {
        let reaped = {
            let mut reactor = core.reactor.borrow_mut();
            reactor.flush()?;
            reactor.poll_completions(&mut self.woken)?
        };

        self.wake_pending();
        Ok(reaped)
    }

    fn wake_pending(&mut self) {
        self.woken.drain(..).for_each(Waker::wake);
    }

    /// Steal phase. On success the task is pushed on our own ready queue.
    fn steal(&mut self, core: &Core) -> bool {
        for _ in 0..self.shared.cfg.max_steal_retries {
            let mut retry = false;

            match self.shared.injector.steal_batch_and_pop(&core.run_queue) {
                Steal::Success(task) => {
                    core.run_queue.push(task);
                    return true;
                }
                Steal::Retry => retry = true,
                Steal::Empty => {}
            }

            for &peer in &self.peers {
                match self.shared.remotes[peer].stealer.steal() {
                    Steal::Success(task) if task.is_stealable() => {
                        tracing::trace!(task.id = %task.id(), worker = self.index, from = peer, "stole task");
                        core.run_queue.push(task);
                        return true;
                    }
                    // Operations in flight on the peer's ring, hand it back.
                    Steal::Success(task) => {
                        let owner = task.header().owner().unwrap_or(peer);
                        self.shared.push_remote(owner, task);
                        retry = true;
                    }
                    Steal::Retry => retry = true,
                    Steal::Empty => {}
                }
            }

            if !retry {
                break;
            }
        }

        false
    }

    fn has_work(&self, core: &Core) -> bool {
        !core.run_queue.is_empty()
            || !self.shared.injector.is_empty()
            || self.shared.remotes[self.index].has_inbox()
            || core
                .timers
                .borrow()
                .next_deadline()
                .is_some_and(|deadline| deadline <= Instant::now())
    }

    /// Blocks in the reactor until a completion, a timer deadline, a foreign
    /// wake or the adaptive timeout.
    fn park(&mut self, core: &Core, root: &RootWaker) -> Result<()> {
        let remote = &self.shared.remotes[self.index];

        // Announce before the last check: a producer that misses the flag
        // pushed its work before we look at the queues.
        let seen = remote.begin_park();

        if self.has_work(core) || root.is_woken() || self.shared.is_shutdown() {
            remote.end_park();
            return Ok(());
        }

        let mut timeout = self.park_timeout;
        if let Some(deadline) = core.timers.borrow().next_deadline() {
            timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        }

        let res = {
            let mut reactor = core.reactor.borrow_mut();

            match reactor.arm_wakeup(&remote.wake_word, seen) {
                Ok(true) => {}
                Ok(false) => timeout = timeout.min(UNSUPPORTED_FUTEX_PARK_TIMEOUT),
                Err(e) => tracing::warn!(worker = self.index, "failed to arm wake-up: {}", e),
            }

            tracing::trace!(worker = self.index, ?timeout, "parking");
            reactor.wait(Some(timeout), &mut self.woken)
        };

        remote.end_park();
        let reaped = res?;
        self.wake_pending();

        self.park_timeout = if reaped > 0 {
            self.shared.cfg.park_timeout_min
        } else {
            (self.park_timeout * 2).min(self.shared.cfg.park_timeout_max)
        };

        Ok(())
    }

    /// Drops every task this worker is responsible for, on this thread, so
    /// their in-flight operations are orphaned into this worker's reactor.
    pub(crate) fn shutdown(&mut self, core: &Core) {
        let remote = &self.shared.remotes[self.index];

        let mut tasks = std::iter::from_fn(|| core.run_queue.pop()).collect::<Vec<_>>();
        tasks.extend(remote.take_inbox());
        tasks.extend(self.shared.tasks.drain_owned_by(self.index));

        tracing::debug!(worker = self.index, num_tasks = tasks.len(), "worker shutting down");

        for task in tasks {
            task.shutdown();
        }

        // Sleeps were dropped along with their tasks, remaining wakers are stale.
        core.timers.borrow_mut().clear();
    }
}

/// Waker of the future passed to `block_on`. It is polled by the root worker
/// outside of any task.
struct RootWaker {
    woken: AtomicBool,
    shared: Arc<Shared>,
    index: usize,
}

impl RootWaker {
    fn new(shared: Arc<Shared>, index: usize) -> Self {
        RootWaker {
            // Poll once on entry.
            woken: AtomicBool::new(true),
            shared,
            index,
        }
    }

    fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    fn take_woken(&self) -> bool {
        self.woken.swap(false, Ordering::AcqRel)
    }
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        self.shared.unpark(self.index);
    }
}

#[derive(Debug, Clone)]
struct EventLoopPolicy {
    // Policies
    global_queue_interval: u32,

    process_cqes_interval: u32,

    submit_interval: u32,

    max_unsubmitted_sqes: usize,

    // Data
    unsubmitted_sqes: usize,

    has_ready_cqes: bool,
}

impl EventLoopPolicy {
    #[inline(always)]
    fn update(&mut self, core: &Core) {
        let mut reactor = core.reactor.borrow_mut();
        self.unsubmitted_sqes = reactor.num_unsubmitted();
        self.has_ready_cqes = reactor.has_ready();
    }

    #[inline(always)]
    fn should_pop_global_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.global_queue_interval)
    }

    #[inline(always)]
    fn should_process_cqes(&self, tick: u32) -> bool {
        self.has_ready_cqes && tick.is_multiple_of(self.process_cqes_interval)
    }

    #[inline(always)]
    fn should_fire_timers(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.process_cqes_interval)
    }

    #[inline(always)]
    fn should_submit(&self, tick: u32) -> bool {
        self.unsubmitted_sqes > 0
            && (tick.is_multiple_of(self.submit_interval)
                || self.unsubmitted_sqes >= self.max_unsubmitted_sqes)
    }
}

impl From<&Shared> for EventLoopPolicy {
    fn from(shared: &Shared) -> EventLoopPolicy {
        EventLoopPolicy {
            global_queue_interval: shared.cfg.global_queue_interval,
            process_cqes_interval: shared.cfg.process_cqes_interval,
            submit_interval: shared.cfg.submit_interval,
            max_unsubmitted_sqes: shared.cfg.max_unsubmitted_sqes,
            unsubmitted_sqes: 0,
            has_ready_cqes: false,
        }
    }
}

impl TickerData for EventLoopPolicy {
    type Context = Context;

    #[inline(always)]
    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents {
        // (1) Fast-path to enforce shutdown
        if ctx.handle.shared.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        // (2) Update data
        self.update(&ctx.core);

        // (3) Check policies
        let mut events = TickerEvents::empty();

        if self.should_pop_global_queue(tick) {
            events.insert(TickerEvents::POP_GLOBAL_QUEUE);
        }

        if self.should_process_cqes(tick) {
            events.insert(TickerEvents::PROCESS_CQES);
        }

        if self.should_fire_timers(tick) {
            events.insert(TickerEvents::FIRE_TIMERS);
        }

        if self.should_submit(tick) {
            events.insert(TickerEvents::SUBMIT_SQES);
        }

        events
    }
}
