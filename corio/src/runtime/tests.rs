use super::*;
use crate as corio;
use crate::context;
use crate::sync::oneshot;
use crate::test_utils::*;
use crate::time::{sleep, sleep_until};
use anyhow::Result;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Handle: Send, Sync, Clone, Schedule);

#[corio::test]
async fn test_spawn_and_join() -> Result<()> {
    let handle = spawn(async { 40 + 2 });
    assert_eq!(handle.await?, 42);
    Ok(())
}

#[corio::test]
async fn test_local_runs_in_spawn_order() -> Result<()> {
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles = (0..10)
        .map(|i| {
            let order = Arc::clone(&order);
            spawn(async move { order.lock().push(i) })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.await?;
    }

    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    Ok(())
}

#[rstest]
#[case::two_workers(2)]
#[case::four_workers(4)]
#[corio::test(flavor = "stealing", worker_threads = 4)]
async fn test_stealing_spreads_work(#[case] tasks_per_worker: usize) -> Result<()> {
    let num_workers = Handle::current().num_workers();
    assert_eq!(num_workers, 5);

    let handles = (0..num_workers * tasks_per_worker)
        .map(|_| {
            spawn_mt(async {
                // Hog the worker so idle ones have to pick up the rest.
                thread::sleep(Duration::from_millis(20));
                context::current_worker()
            })
        })
        .collect::<Vec<_>>();

    let mut workers = HashSet::new();
    for handle in handles {
        let worker = handle.await?.expect("task ran outside of a worker");
        assert!(worker < num_workers);
        workers.insert(worker);
    }

    assert!(workers.len() > 1, "all tasks ran on worker {workers:?}");
    Ok(())
}

#[corio::test(flavor = "stealing", worker_threads = 2)]
async fn test_sticky_task_stays_on_worker() -> Result<()> {
    let handle = spawn_builder().opts(TaskOpts::STICKY).spawn_mt(async {
        let first = context::current_worker();
        for _ in 0..20 {
            crate::time::yield_now().await;
            thread::sleep(Duration::from_millis(1));
            assert_eq!(context::current_worker(), first);
        }
        first
    });

    assert!(handle.await?.is_some());
    Ok(())
}

#[test]
fn test_spawn_from_foreign_thread() -> Result<()> {
    let rt = init_local_runtime()?;
    let handle = rt.handle().clone();
    let (source, token) = oneshot::channel();

    let foreign = thread::spawn(move || {
        let join = handle.spawn(async { context::current_worker() });
        let worker = join.join().expect("task failed");
        source.set_value(worker);
    });

    let worker = rt.block_on(token)?;
    assert_eq!(worker, Some(0));

    foreign.join().expect("foreign thread panicked");
    Ok(())
}

#[test]
fn test_shutdown_cancels_pending_tasks() -> Result<()> {
    let rt = init_stealing_runtime(2)?;

    let pending = rt.spawn(async {
        sleep(Duration::from_secs(3600)).await;
    });
    let done = rt.spawn(async { 7 });

    assert_eq!(rt.block_on(done)?, 7);
    assert!(!pending.is_finished());

    rt.shutdown();

    let err = pending.join().expect_err("task survived shutdown");
    assert!(err.is_cancelled());
    Ok(())
}

#[test]
fn test_spawn_after_shutdown_is_cancelled() -> Result<()> {
    let rt = init_local_runtime()?;
    let handle = rt.handle().clone();
    rt.shutdown();

    let err = handle.spawn(async { 1 }).join().expect_err("spawned on a dead runtime");
    assert!(err.is_cancelled());
    assert_eq!(handle.num_alive_tasks(), 0);
    Ok(())
}

#[corio::test]
async fn test_panic_becomes_join_error() -> Result<()> {
    let handle = spawn(async {
        if true {
            panic!("boom");
        }
        1u32
    });

    let err = handle.await.expect_err("panic was swallowed");
    assert!(err.is_panic());
    assert_eq!(err.panic_message().as_deref(), Some("boom"));

    // The worker survives the panic.
    assert_eq!(spawn(async { 2 }).await?, 2);
    Ok(())
}

#[test]
fn test_nested_runtime_is_rejected() -> Result<()> {
    let rt = init_local_runtime()?;

    assert!(Builder::new_local().try_build().is_err());

    let nested = rt.block_on(async { Builder::new_stealing().worker_threads(1).try_build() });
    assert!(nested.is_err());

    // A new runtime may be built once the previous one is gone.
    drop(rt);
    let rt = init_local_runtime()?;
    assert_eq!(rt.block_on(async { 3 }), 3);
    Ok(())
}

#[test]
fn test_block_on_is_reentrant_after_return() -> Result<()> {
    let rt = init_local_runtime()?;

    let background = rt.spawn(async {
        sleep(Duration::from_millis(30)).await;
        5
    });

    assert_eq!(rt.block_on(async { 1 }), 1);
    assert_eq!(rt.block_on(background)?, 5);
    Ok(())
}

#[corio::test]
async fn test_random_sleeps_fire_in_deadline_order() -> Result<()> {
    // Leave room for every task to register its timer before the first fires.
    let start = Instant::now() + Duration::from_millis(50);
    let fired = Arc::new(Mutex::new(Vec::with_capacity(1000)));

    let handles = (0..1000)
        .map(|_| {
            let deadline = start + Duration::from_millis(fastrand::u64(0..200));
            let fired = Arc::clone(&fired);
            spawn(async move {
                sleep_until(deadline).await;
                assert!(Instant::now() >= deadline);
                fired.lock().push(deadline);
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.await?;
    }

    let fired = fired.lock();
    assert_eq!(fired.len(), 1000);
    assert!(fired.is_sorted(), "timers fired out of deadline order");
    Ok(())
}
