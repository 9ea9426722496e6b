use crate::runtime::Runtime;
use crate::utils::thread::available_cpus;
use anyhow::{Result, ensure};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Default size for io_uring SQ ring.
const SQ_RING_SIZE: usize = 1024;

/// Final cq ring size is SQ_RING_SIZE * multipler
const CQ_RING_SIZE_MULTIPLIER: usize = 2;

//
// Event Loop policies
//
/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

#[cfg(not(test))]
const PROCESS_CQES_INTERVAL: u32 = 61;

#[cfg(test)]
const PROCESS_CQES_INTERVAL: u32 = 8; // make tests tick faster

/// Submit 4 times as frequently as we complete to keep kernel busy.
const SUBMIT_INTERVAL: u32 = PROCESS_CQES_INTERVAL / 4;

/// Submit if sq ring 33% full
const MAX_UNSUBMITTED_SQES: usize = SQ_RING_SIZE / 3;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

/// First blocking wait of an idle worker. Doubles on every idle pass.
const PARK_TIMEOUT_MIN: Duration = Duration::from_micros(50);

const PARK_TIMEOUT_MAX: Duration = Duration::from_millis(100);

const MAX_BLOCKING_THREADS: usize = 512;

/// How long a worker waits for the kernel to release operation memory when the
/// runtime shuts down.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Local,
    Stealing,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("corio-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and creates a [`Runtime`].
///
/// ```no_run
/// use corio::runtime::Builder;
///
/// let rt = Builder::new_stealing()
///     .worker_threads(4)
///     .thread_name("my-worker")
///     .try_build()?;
///
/// rt.block_on(async {
///     corio::spawn(async { println!("hello from a worker") }).await
/// })?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Runtime type
    kind: Kind,

    /// The number of worker threads, used by the stealing scheduler. Defaults
    /// to 1 per core. The thread calling `block_on` is an extra worker.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,

    /// How many ticks before pulling a task from the global injector queue.
    global_queue_interval: u32,

    /// Process CQEs every N ticks
    process_cqes_interval: u32,

    /// Submit SQEs every N ticks
    submit_interval: u32,

    /// Maximum amount of unsubmitted sqes before we force submit
    max_unsubmitted_sqes: usize,

    /// How many times a worker will loop over the global injector queue and
    /// other workers' queues to try and find work before blocking.
    max_steal_retries: usize,

    /// Size of io_uring SQ ring
    sq_ring_size: usize,

    /// Final size of cq ring will be `sq_ring_size * cq_ring_size_multiplier`.
    /// The operation slab has the size of the CQ ring: a full SQ ring is
    /// recovered by flushing, a full slab only by reaping completions.
    cq_ring_size_multiplier: usize,

    /// Pin worker N to CPU `N % num_cpus`.
    pin_workers: bool,

    park_timeout_min: Duration,

    park_timeout_max: Duration,

    max_blocking_threads: usize,
}

impl Builder {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            process_cqes_interval: PROCESS_CQES_INTERVAL,
            submit_interval: SUBMIT_INTERVAL,
            max_unsubmitted_sqes: MAX_UNSUBMITTED_SQES,
            max_steal_retries: MAX_STEAL_RETRIES,
            sq_ring_size: SQ_RING_SIZE,
            cq_ring_size_multiplier: CQ_RING_SIZE_MULTIPLIER,
            pin_workers: false,
            park_timeout_min: PARK_TIMEOUT_MIN,
            park_timeout_max: PARK_TIMEOUT_MAX,
            max_blocking_threads: MAX_BLOCKING_THREADS,
        }
    }

    /// Returns a new builder with the local thread scheduler selected.
    ///
    /// The runtime has a single worker: the thread that calls `block_on`.
    pub fn new_local() -> Builder {
        Builder::new(Kind::Local)
    }

    /// Returns a new builder with the work-stealing scheduler selected.
    pub fn new_stealing() -> Builder {
        Builder::new(Kind::Stealing)
    }

    /// The number of worker threads, used by the Runtime. Only relevant when
    /// using the stealing scheduler.
    ///
    /// Defaults to 1 worker per CPU core.
    ///
    /// The thread calling `block_on` also runs a worker, which *does not
    /// count* towards this number.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets name of threads spawned by the `Runtime`'s thread pool.
    ///
    /// The default name is "corio-{id}", where id is monotonically
    /// increasing.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the `Runtime`'s thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the number of scheduler ticks after which the scheduler will poll the global
    /// task queue.
    ///
    /// A scheduler "tick" roughly corresponds to one `poll` invocation on a task.
    ///
    /// Setting the interval to a smaller value increases the fairness of the
    /// scheduler towards tasks spawned from other threads, at the cost of more
    /// synchronization overhead.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn process_cqes_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "process_cqes_interval must be greater than 0");
        self.process_cqes_interval = val;
        self
    }

    #[track_caller]
    pub fn submit_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "submit_interval must be greater than 0");
        self.submit_interval = val;
        self
    }

    #[track_caller]
    pub fn max_unsubmitted_sqes(mut self, val: usize) -> Self {
        assert!(val > 0, "max_unsubmitted_sqes must be greater than 0");
        self.max_unsubmitted_sqes = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    #[track_caller]
    pub fn sq_ring_size(mut self, val: usize) -> Self {
        assert!(val.is_power_of_two(), "sq_ring_size must be a power of two");
        self.sq_ring_size = val;
        self
    }

    #[track_caller]
    pub fn cq_ring_size_multiplier(mut self, val: usize) -> Self {
        assert!(val > 0, "cq_ring_size_multiplier must be greater than 0");
        self.cq_ring_size_multiplier = val;
        self
    }

    /// Pins every worker to one CPU core. Disabled by default.
    pub fn pin_workers(mut self, val: bool) -> Self {
        self.pin_workers = val;
        self
    }

    /// Shortest blocking wait of an idle worker.
    #[track_caller]
    pub fn park_timeout_min(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "park_timeout_min must be greater than 0");
        self.park_timeout_min = val;
        self
    }

    /// Longest blocking wait of an idle worker. Foreign wakes always interrupt
    /// the wait, so this only bounds the latency of missed wake-ups.
    #[track_caller]
    pub fn park_timeout_max(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "park_timeout_max must be greater than 0");
        self.park_timeout_max = val;
        self
    }

    /// Upper bound of threads running `spawn_blocking` closures.
    #[track_caller]
    pub fn max_blocking_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "max_blocking_threads must be greater than 0");
        self.max_blocking_threads = val;
        self
    }

    /// Creates the configured `Runtime`.
    ///
    /// Worker threads are started right away. Tasks only run once the calling
    /// thread enters [`Runtime::block_on`] on the local flavor.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg = RuntimeConfig::try_from(self)?;
        Runtime::try_new(cfg)
    }
}

/// Validated runtime configuration, handed to every worker.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) kind: Kind,
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
    pub(crate) process_cqes_interval: u32,
    pub(crate) submit_interval: u32,
    pub(crate) max_unsubmitted_sqes: usize,
    pub(crate) max_steal_retries: usize,
    pub(crate) sq_ring_size: usize,
    pub(crate) cq_ring_size_multiplier: usize,
    pub(crate) pin_workers: bool,
    pub(crate) park_timeout_min: Duration,
    pub(crate) park_timeout_max: Duration,
    pub(crate) max_blocking_threads: usize,
    pub(crate) shutdown_drain_timeout: Duration,
}

impl RuntimeConfig {
    /// Number of spawned worker threads. The `block_on` thread is not counted.
    pub(crate) fn spawned_workers(&self) -> usize {
        match self.kind {
            Kind::Local => 0,
            Kind::Stealing => self.worker_threads,
        }
    }

    /// Total number of workers, including the `block_on` thread.
    pub(crate) fn num_workers(&self) -> usize {
        self.spawned_workers() + 1
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.park_timeout_min <= self.park_timeout_max,
            "park_timeout_min ({:?}) must not exceed park_timeout_max ({:?})",
            self.park_timeout_min,
            self.park_timeout_max
        );

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => available_cpus(),
        };

        let cfg = RuntimeConfig {
            kind: builder.kind,
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            global_queue_interval: builder.global_queue_interval,
            process_cqes_interval: builder.process_cqes_interval,
            submit_interval: builder.submit_interval,
            max_unsubmitted_sqes: builder.max_unsubmitted_sqes.min(builder.sq_ring_size),
            max_steal_retries: builder.max_steal_retries,
            sq_ring_size: builder.sq_ring_size,
            cq_ring_size_multiplier: builder.cq_ring_size_multiplier,
            pin_workers: builder.pin_workers,
            park_timeout_min: builder.park_timeout_min,
            park_timeout_max: builder.park_timeout_max,
            max_blocking_threads: builder.max_blocking_threads,
            shutdown_drain_timeout: SHUTDOWN_DRAIN_TIMEOUT,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    // Cloned into every spawned worker.
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    #[rstest]
    #[case::local(Builder::new_local().worker_threads(8), 0)]
    #[case::stealing(Builder::new_stealing().worker_threads(3), 3)]
    fn test_spawned_workers(#[case] builder: Builder, #[case] expected: usize) -> Result<()> {
        let cfg = RuntimeConfig::try_from(builder)?;
        assert_eq!(cfg.spawned_workers(), expected);
        assert_eq!(cfg.num_workers(), expected + 1);
        Ok(())
    }

    #[test]
    fn test_default_thread_names() {
        let name_fn = default_thread_name_fn();
        assert_eq!((name_fn.0)(), "corio-0");
        assert_eq!((name_fn.0)(), "corio-1");
    }

    #[test]
    fn test_invalid_park_bounds() {
        let builder = Builder::new_local()
            .park_timeout_min(Duration::from_millis(10))
            .park_timeout_max(Duration::from_millis(1));

        assert!(RuntimeConfig::try_from(builder).is_err());
    }

    #[test]
    fn test_unsubmitted_clamped_to_ring() -> Result<()> {
        let cfg = RuntimeConfig::try_from(Builder::new_local().sq_ring_size(64))?;
        assert!(cfg.max_unsubmitted_sqes <= 64);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "sq_ring_size must be a power of two")]
    fn test_sq_ring_size_power_of_two() {
        let _ = Builder::new_local().sq_ring_size(100);
    }
}
