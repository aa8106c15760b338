//! End-to-end Scheduling Tests
//!
//! Tests for:
//! - Pool-level concurrency limiting across multiple tasks
//! - Group-level frequency limiting and window reopening
//! - Combined concurrency + frequency limits on a single task
//! - Insertion-order sweep fairness across sibling tasks

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;

use taskpool::{Generator, GroupOptions, Operation, Pool, PoolOptions, TaskOptions};

const TICK: Duration = Duration::from_millis(40);

fn delayed(start: Instant, delay: Duration) -> Operation<Duration> {
    async move {
        tokio::time::sleep(delay).await;
        Ok(Some(start.elapsed()))
    }
    .boxed()
}

/// `concurrency_limit = 2`, generator awaits one tick then records
/// elapsed, three invocations total — the third can't start until one of
/// the first two frees a slot, so it lands a full tick after the first
/// pair.
#[tokio::test]
async fn concurrency_limit_delays_the_overflow_invocation() {
    let pool = Pool::new(PoolOptions::with_concurrency_limit(2)).unwrap();
    let start = Instant::now();
    let generator: Generator<Duration> = Box::new(move |i| {
        if i >= 3 {
            return None;
        }
        Some(delayed(start, TICK))
    });

    let task = pool.add_generic_task(TaskOptions::new(generator)).await.unwrap();
    let result = task.promise().await.unwrap();
    let elapsed: Vec<Duration> = result.iter().map(|d| d.unwrap()).collect();

    assert!(elapsed[0] < TICK * 3 / 2, "first invocation should finish near one tick");
    assert!(elapsed[1] < TICK * 3 / 2, "second invocation should finish near one tick");
    assert!(
        elapsed[2] >= TICK * 3 / 2,
        "third invocation must wait for a freed concurrency slot before it can even start"
    );
}

/// Frequency-limited group, synchronous generator — the first two
/// invocations are free, the third must wait for the window to reopen.
#[tokio::test]
async fn frequency_limit_delays_invocations_past_the_window() {
    let pool = Pool::unbounded();
    let group = pool
        .add_group(GroupOptions {
            frequency_limit: Some(2),
            frequency_window: Some(TICK),
            ..Default::default()
        })
        .await
        .unwrap();
    let start = Instant::now();
    let generator: Generator<Duration> = Box::new(move |i| {
        if i >= 3 {
            return None;
        }
        Some(futures::future::ready(Ok(Some(start.elapsed()))).boxed())
    });

    let task = pool
        .add_generic_task(TaskOptions::new(generator).groups(vec![group.id()]))
        .await
        .unwrap();
    let result = task.promise().await.unwrap();
    let elapsed: Vec<Duration> = result.iter().map(|d| d.unwrap()).collect();

    assert!(elapsed[0] < TICK / 2);
    assert!(elapsed[1] < TICK / 2);
    assert!(elapsed[2] >= TICK);
}

/// A task with both a concurrency limit of 1 and a frequency limit, each
/// invocation awaiting one tick — operations serialize and the frequency
/// window pushes later starts out further.
#[tokio::test]
async fn concurrency_and_frequency_limits_compose_on_one_task() {
    let pool = Pool::unbounded();
    let start = Instant::now();
    let generator: Generator<Duration> = Box::new(move |i| {
        if i >= 4 {
            return None;
        }
        Some(delayed(start, TICK))
    });

    let task = pool
        .add_generic_task(
            TaskOptions::new(generator)
                .concurrency_limit(1)
                .frequency_limit(2, TICK * 3),
        )
        .await
        .unwrap();
    let result = task.promise().await.unwrap();
    let elapsed: Vec<Duration> = result.iter().map(|d| d.unwrap()).collect();

    // Strictly increasing completion times; each invocation starts only
    // after the previous one both completed (concurrency = 1) and a
    // frequency slot reopened.
    for pair in elapsed.windows(2) {
        assert!(pair[1] > pair[0], "invocations must complete strictly later: {elapsed:?}");
    }
}

/// Sibling tasks registered on the same pool are advanced in insertion
/// order on every sweep; under a saturating global limit, the
/// earlier-registered task should see its operations dispatched first.
#[tokio::test]
async fn sibling_tasks_advance_in_insertion_order() {
    let pool = Pool::new(PoolOptions::with_concurrency_limit(1)).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let make_generator = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| -> Generator<()> {
        let mut done = false;
        Box::new(move |_i| {
            if done {
                return None;
            }
            done = true;
            let order = order.clone();
            Some(
                async move {
                    order.lock().push(label);
                    Ok(Some(()))
                }
                .boxed(),
            )
        })
    };

    let first = pool
        .add_generic_task(TaskOptions::new(make_generator("first", order.clone())))
        .await
        .unwrap();
    let second = pool
        .add_generic_task(TaskOptions::new(make_generator("second", order.clone())))
        .await
        .unwrap();

    first.promise().await.unwrap();
    second.promise().await.unwrap();
    assert_eq!(*order.lock(), vec!["first", "second"]);
}

/// Setting a group's concurrency limit to zero/NaN-equivalent (here: any
/// non-positive value) must fail synchronously with `InvalidConfig` and
/// leave the previous limit untouched.
#[tokio::test]
async fn invalid_limit_update_is_rejected_synchronously() {
    let pool = Pool::unbounded();
    let group = pool.add_group(GroupOptions::default()).await.unwrap();
    let err = group.set_concurrency_limit(Some(0)).await.unwrap_err();
    assert!(matches!(err, taskpool::Error::InvalidConfig(_)));
    let stats = group.stats().await;
    assert_eq!(stats.concurrency_limit, None);
}

/// A task's rejection propagates to every affiliated group: a sibling
/// task waiting for that group to go idle observes the same failure
/// rather than silently succeeding once the rejecting task ends.
#[tokio::test]
async fn group_wait_for_idle_surfaces_a_sibling_tasks_rejection() {
    let pool = Pool::unbounded();
    let group = pool.add_group(GroupOptions::default()).await.unwrap();
    let failing: Generator<()> = Box::new(|i| {
        if i == 0 {
            Some(futures::future::ready(Err(taskpool::error::Error::GeneratorFailure("boom".into()))).boxed())
        } else {
            None
        }
    });
    pool.add_generic_task(TaskOptions::new(failing).groups(vec![group.id()]))
        .await
        .unwrap();

    let err = group.wait_for_idle().await.unwrap_err();
    assert!(matches!(*err, taskpool::error::Error::GeneratorFailure(_)));
}

/// Counter guard: increment bookkeeping never exceeds the pool's reported
/// concurrency during a burst of fast operations.
#[tokio::test]
async fn active_promise_count_never_exceeds_concurrency_limit() {
    let pool = Pool::new(PoolOptions::with_concurrency_limit(3)).unwrap();
    let peak = Arc::new(AtomicU32::new(0));
    let inflight = Arc::new(AtomicU32::new(0));
    let p = peak.clone();
    let inf = inflight.clone();
    let generator: Generator<()> = Box::new(move |i| {
        if i >= 30 {
            return None;
        }
        let p = p.clone();
        let inf = inf.clone();
        Some(
            async move {
                let now = inf.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inf.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(()))
            }
            .boxed(),
        )
    });
    let task = pool.add_generic_task(TaskOptions::new(generator)).await.unwrap();
    task.promise().await.unwrap();
    assert!(peak.load(Ordering::SeqCst) <= 3);
}
