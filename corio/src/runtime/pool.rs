use crate::context::{self, Core};
use crate::runtime::Handle;
use crate::runtime::worker::Worker;
use crate::task::Task;
use crate::utils::thread::pin_current_thread;
use anyhow::{Context as _, Result, anyhow};
use crossbeam_deque::Worker as CbWorker;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::thread;

/// The worker threads of a stealing runtime. The `block_on` thread is worker
/// 0 and is not part of the pool.
#[derive(Debug, Default)]
pub(crate) struct WorkerPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns one thread per queue, worker `i + 1` owning `queues[i]`.
    ///
    /// Returns once every worker created its ring, so a kernel refusing
    /// io_uring fails the build instead of a background thread.
    pub(crate) fn start(handle: &Handle, queues: Vec<CbWorker<Task>>) -> Result<Self> {
        let pool = WorkerPool::default();
        let (tx, rx) = mpsc::channel();

        let mut errors = Vec::new();

        for (i, queue) in queues.into_iter().enumerate() {
            match spawn_worker_thread(handle.clone(), i + 1, queue, tx.clone()) {
                Ok(join) => pool.handles.lock().push(join),
                Err(e) => {
                    errors.push(e);
                    break;
                }
            }
        }
        drop(tx);

        errors.extend(rx.iter().filter_map(Result::err));
        if let Some(err) = errors.into_iter().next() {
            handle.shared.begin_shutdown();
            handle.shared.unpark_all();
            // Workers that did start exit on the shutdown flag.
            let _ = pool.join_all();
            return Err(err);
        }

        Ok(pool)
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());

        let panicked = handles
            .into_iter()
            .filter_map(|handle| {
                let name = handle.thread().name().map(str::to_owned);
                handle.join().err().map(|_| name)
            })
            .collect::<Vec<_>>();

        if panicked.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked: {:?}", panicked.len(), panicked))
        }
    }
}

fn spawn_worker_thread(
    handle: Handle,
    index: usize,
    queue: CbWorker<Task>,
    ready: mpsc::Sender<Result<()>>,
) -> Result<thread::JoinHandle<()>> {
    let cfg = &handle.shared.cfg;
    let mut builder = thread::Builder::new().name((cfg.thread_name.0)());

    if let Some(stack_size) = cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(move || {
            let cfg = &handle.shared.cfg;

            if cfg.pin_workers
                && let Err(e) = pin_current_thread(index)
            {
                tracing::warn!(worker = index, "failed to pin worker thread: {}", e);
            }

            let core = match Core::try_new(index, cfg, queue) {
                Ok(core) => core,
                Err(e) => {
                    let _ = ready.send(Err(e.context(format!("failed to start worker {index}"))));
                    return;
                }
            };

            let _ = ready.send(Ok(()));
            drop(ready);

            run_worker(handle, core);
        })
        .context("failed to spawn worker thread")
}

fn run_worker(handle: Handle, core: Core) {
    let index = core.index;
    let mut worker = Worker::new(&handle, index);
    let guard = context::enter(handle, core);
    let ctx = context::expect_current();

    if let Err(e) = worker.run::<std::future::Pending<()>>(&ctx, None) {
        tracing::error!(worker = index, "worker failed: {:#}", e);
    }

    worker.shutdown(&ctx.core);

    drop(ctx);
    drop(guard);
}
