use super::*;
use crate as corio;
use crate::error::Error;
use crate::time::{sleep, sleep_cancellable, yield_now};
use anyhow::Result;
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[rstest]
#[case::one(1)]
#[case::eight(8)]
#[case::many(64)]
#[corio::test]
async fn test_cancel_waits_for_every_ack(#[case] k: usize) -> Result<()> {
    let source = CancelSource::new();
    let acks = Arc::new(AtomicUsize::new(0));

    let handles = (0..k)
        .map(|_| {
            let token = source.token();
            let acks = Arc::clone(&acks);
            corio::spawn(async move {
                let res = sleep_cancellable(Duration::from_secs(30), &token).await;
                assert!(matches!(res, Err(Error::Canceled)));
                acks.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect::<Vec<_>>();

    while source.num_registered() < k {
        yield_now().await;
    }

    let start = Instant::now();
    source.cancel().await;

    assert_eq!(acks.load(Ordering::Relaxed), k);
    assert_eq!(source.num_registered(), 0);
    assert!(start.elapsed() < Duration::from_secs(1));

    for handle in handles {
        handle.await?;
    }

    Ok(())
}

#[corio::test]
async fn test_cancel_without_registrations_is_immediate() -> Result<()> {
    let source = CancelSource::new();
    assert!(!source.is_canceled());

    source.cancel().await;
    assert!(source.is_canceled());
    assert!(source.token().is_canceled());

    // Cancel is idempotent.
    source.cancel().await;
    Ok(())
}

#[corio::test]
async fn test_canceled_scope_short_circuits() -> Result<()> {
    let source = CancelSource::new();
    source.cancel().await;

    let started = Arc::new(AtomicUsize::new(0));
    let res = source
        .token()
        .abortable({
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::Relaxed);
            }
        })
        .await;

    assert!(matches!(res, Err(Error::Canceled)));
    assert_eq!(started.load(Ordering::Relaxed), 0);
    assert_eq!(source.num_registered(), 0);
    Ok(())
}

#[corio::test]
async fn test_natural_completion_wins() -> Result<()> {
    let source = CancelSource::new();
    let token = source.token();

    let res = token.abortable(async { 7 }).await;
    assert_eq!(res?, 7);

    // Completed before the cancel, nothing to acknowledge.
    assert_eq!(source.num_registered(), 0);
    source.cancel().await;
    Ok(())
}

#[corio::test]
async fn test_abortable_drops_future_on_cancel() -> Result<()> {
    struct SetOnDrop(Arc<AtomicUsize>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let source = CancelSource::new();
    let token = source.token();
    let dropped = Arc::new(AtomicUsize::new(0));

    let handle = corio::spawn({
        let dropped = Arc::clone(&dropped);
        async move {
            token
                .abortable(async move {
                    let _guard = SetOnDrop(dropped);
                    sleep(Duration::from_secs(30)).await;
                })
                .await
        }
    });

    while source.num_registered() == 0 {
        yield_now().await;
    }

    source.cancel().await;
    assert_eq!(dropped.load(Ordering::Relaxed), 1);
    assert!(matches!(handle.await?, Err(Error::Canceled)));
    Ok(())
}

#[corio::test]
async fn test_cancelled_resolves_on_cancel() -> Result<()> {
    let source = CancelSource::new();
    let token = source.token();

    let handle = corio::spawn(async move {
        token.cancelled().await;
        "done"
    });

    yield_now().await;
    assert!(!handle.is_finished());

    source.cancel().await;
    assert_eq!(handle.await?, "done");
    Ok(())
}

#[corio::test]
async fn test_child_scope_follows_parent() -> Result<()> {
    let parent = CancelSource::new();
    let child = CancelSource::child_of(&parent.token());
    assert_eq!(parent.num_registered(), 1);

    let handle = {
        let token = child.token();
        corio::spawn(async move { sleep_cancellable(Duration::from_secs(30), &token).await })
    };

    while child.num_registered() == 0 {
        yield_now().await;
    }

    parent.cancel().await;

    assert!(child.is_canceled());
    assert_eq!(child.num_registered(), 0);
    assert_eq!(parent.num_registered(), 0);
    assert!(matches!(handle.await?, Err(Error::Canceled)));
    Ok(())
}

#[corio::test]
async fn test_child_cancel_leaves_parent_live() -> Result<()> {
    let parent = CancelSource::new();
    let child = CancelSource::child_of(&parent.token());

    child.cancel().await;

    assert!(child.is_canceled());
    assert!(!parent.is_canceled());
    assert_eq!(parent.num_registered(), 0);

    // Children of a canceled scope start canceled.
    parent.cancel().await;
    let late = CancelSource::child_of(&parent.token());
    assert!(late.is_canceled());
    Ok(())
}

#[corio::test]
async fn test_dropped_child_deregisters() -> Result<()> {
    let parent = CancelSource::new();

    {
        let _child = CancelSource::child_of(&parent.token());
        assert_eq!(parent.num_registered(), 1);
    }

    assert_eq!(parent.num_registered(), 0);
    Ok(())
}

#[corio::test(flavor = "stealing", worker_threads = 4)]
async fn test_cancel_across_workers() -> Result<()> {
    let source = CancelSource::new();
    let n = 32;

    let handles = (0..n)
        .map(|_| {
            let token = source.token();
            corio::spawn_mt(async move { token.cancelled().await })
        })
        .collect::<Vec<_>>();

    while source.num_registered() < n {
        yield_now().await;
    }

    source.cancel().await;
    assert_eq!(source.num_registered(), 0);

    for handle in handles {
        handle.await?;
    }

    Ok(())
}
