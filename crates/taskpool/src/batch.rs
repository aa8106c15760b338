//! The persistent batcher: an always-on task that accumulates
//! individually-submitted items into batches and releases them once a size
//! or time threshold is crossed.
//!
//! The batcher is built entirely on top of the generic task engine in
//! `task.rs` / `pool.rs` — there is no separate scheduling path. Its
//! generator never returns `None`, so the underlying task never reaches
//! `Exhausted` on its own — it runs indefinitely until explicitly ended;
//! each invocation is one wait-for-a-release-condition cycle that
//! resolves once a batch has been drained and dispatched. Concurrency
//! across invocations is governed by the usual task-exclusive group
//! concurrency limit, so `concurrency_limit` on a batcher is exactly
//! how many batches may be in flight at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::error::{Error, Result, SharedError};
use crate::group::DEFAULT_FREQUENCY_WINDOW;
use crate::ids::GroupId;
use crate::pool::{GroupHandle, Pool, TaskHandle};
use crate::task::{Generator, Operation, TaskOptions};

/// Per-item outcome a batch function reports for each input it was given,
/// in the same order as the input slice.
pub enum ItemResult<In, Out> {
    Value(Out),
    Failure(Error),
    /// Resubmit `In` at the front of the next batch instead of resolving
    /// it. Relative order among retried items within one batch is preserved.
    Retry(In),
}

/// `(items) -> per-item results`, called once per released batch. Must be
/// `Sync` because more than one batch may be in flight at once when
/// `concurrency_limit > 1`.
pub type BatchFn<In, Out> =
    dyn Fn(Vec<In>) -> BoxFuture<'static, Result<Vec<ItemResult<In, Out>>>> + Send + Sync;

/// Construction options for a [`PersistentBatcher`].
pub struct PersistentBatchOptions<In, Out> {
    generator: Arc<BatchFn<In, Out>>,
    max_batch_size: usize,
    queuing_thresholds: Vec<usize>,
    queuing_delay: Duration,
    concurrency_limit: Option<u32>,
    frequency_limit: Option<u32>,
    frequency_window: Option<Duration>,
    groups: Vec<GroupId>,
}

impl<In, Out> PersistentBatchOptions<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new<F>(generator: F) -> Self
    where
        F: Fn(Vec<In>) -> BoxFuture<'static, Result<Vec<ItemResult<In, Out>>>> + Send + Sync + 'static,
    {
        Self {
            generator: Arc::new(generator),
            max_batch_size: usize::MAX,
            queuing_thresholds: vec![1],
            queuing_delay: Duration::from_millis(1),
            // One batch in flight at a time by default; the generator never
            // returns `None`, so an unbounded concurrency limit here would
            // let the scheduler spin up as many concurrently-waiting
            // invocations as its synchronous-run throttle allows.
            concurrency_limit: Some(1),
            frequency_limit: None,
            frequency_window: None,
            groups: Vec::new(),
        }
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// One threshold per concurrently active batch, indexed by
    /// `min(active_batch_count, len - 1)`.
    pub fn queuing_thresholds(mut self, thresholds: Vec<usize>) -> Self {
        self.queuing_thresholds = thresholds;
        self
    }

    pub fn queuing_delay(mut self, delay: Duration) -> Self {
        self.queuing_delay = delay;
        self
    }

    pub fn concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn frequency_limit(mut self, limit: u32, window: Duration) -> Self {
        self.frequency_limit = Some(limit);
        self.frequency_window = Some(window);
        self
    }

    pub fn groups(mut self, groups: Vec<GroupId>) -> Self {
        self.groups = groups;
        self
    }
}

struct QueuedItem<In, Out> {
    value: In,
    reply: oneshot::Sender<std::result::Result<Out, SharedError>>,
}

struct BatcherState<In, Out> {
    queue: VecDeque<QueuedItem<In, Out>>,
    active_batch_count: u32,
    /// Set the first time the queue crosses a threshold without reaching
    /// `max_batch_size`; cleared once that batch is released or the queue
    /// drops back below the threshold some other way.
    threshold_deadline: Option<Instant>,
    /// Set by `end()`. Once true, `get_result()` fails immediately with
    /// `TaskEnded` and the generator's wait loop drains out instead of
    /// waiting for another release condition.
    ended: bool,
    /// Set by `send()`: the next release bypasses both the size and delay
    /// thresholds. Cleared once the queue has been fully drained.
    force_release: bool,
}

enum ReleaseDecision<In, Out> {
    Ready(Vec<QueuedItem<In, Out>>),
    Wait(Option<Instant>),
    Ended,
}

struct BatcherInner<In, Out> {
    state: Mutex<BatcherState<In, Out>>,
    notify: Notify,
    max_batch_size: usize,
    queuing_thresholds: Vec<usize>,
    queuing_delay: Duration,
}

impl<In, Out> BatcherInner<In, Out> {
    /// Drain a batch if one is releasable right now, else report when to
    /// check again. There are two release paths: immediate once the queue
    /// reaches `max_batch_size`, or delayed at a per-depth threshold.
    /// `Ended` means `end()` drained the queue itself and this invocation
    /// should exit without ever calling the user's batch function.
    fn try_take_ready(&self, now: Instant) -> ReleaseDecision<In, Out> {
        let mut state = self.state.lock();
        if state.ended {
            return ReleaseDecision::Ended;
        }
        let len = state.queue.len();
        if len == 0 {
            state.threshold_deadline = None;
            state.force_release = false;
            return ReleaseDecision::Wait(None);
        }
        if state.force_release || len >= self.max_batch_size {
            state.threshold_deadline = None;
            let n = self.max_batch_size.min(len);
            let batch: Vec<_> = state.queue.drain(..n).collect();
            if state.queue.is_empty() {
                state.force_release = false;
            }
            drop(state);
            self.record_queue_depth();
            return ReleaseDecision::Ready(batch);
        }

        let idx = (state.active_batch_count as usize).min(self.queuing_thresholds.len().saturating_sub(1));
        let threshold = self.queuing_thresholds.get(idx).copied().unwrap_or(usize::MAX);
        if len < threshold {
            state.threshold_deadline = None;
            return ReleaseDecision::Wait(None);
        }

        let deadline = *state.threshold_deadline.get_or_insert_with(|| now + self.queuing_delay);
        if now >= deadline {
            state.threshold_deadline = None;
            let batch: Vec<_> = state.queue.drain(..).collect();
            drop(state);
            self.record_queue_depth();
            ReleaseDecision::Ready(batch)
        } else {
            ReleaseDecision::Wait(Some(deadline))
        }
    }

    /// Drain and reject every queued waiter with `TaskEnded`, and mark the
    /// batcher so no further item is ever accepted.
    fn end(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.ended = true;
            state.threshold_deadline = None;
            state.queue.drain(..).collect()
        };
        for item in drained {
            let _ = item.reply.send(Err(Arc::new(Error::TaskEnded)));
        }
        self.record_queue_depth();
        self.notify.notify_waiters();
    }

    fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    /// Force the next release to bypass both the size and delay thresholds,
    /// then wake any invocation currently waiting on one of them.
    fn force_release(&self) {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            return;
        }
        state.force_release = true;
        state.threshold_deadline = None;
        drop(state);
        self.notify.notify_waiters();
    }

    fn queue_depth(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Publish the current queue depth to the metrics facade. Called after
    /// every mutation of the queue (enqueue, release, retry, end).
    fn record_queue_depth(&self) {
        crate::metrics::set_batcher_queue_depth(self.queue_depth() as u32);
    }

    /// Re-enqueue retried items at the front, preserving their relative
    /// order. If `end()` landed while the batch that produced these
    /// retries was in flight, there is no future release to carry them —
    /// fail them with `TaskEnded` instead of stranding them in a queue
    /// nothing will ever drain again.
    fn requeue_front(&self, retried: Vec<QueuedItem<In, Out>>) {
        if retried.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.ended {
            drop(state);
            for item in retried {
                let _ = item.reply.send(Err(Arc::new(Error::TaskEnded)));
            }
            return;
        }
        for item in retried.into_iter().rev() {
            state.queue.push_front(item);
        }
        drop(state);
        self.record_queue_depth();
    }
}

/// Runs the user's batch function over one drained batch, never letting a
/// batch-level failure escape as an `Err` toward the task engine — a
/// failing batch function rejects every item in the batch, not the
/// batcher task itself. Items the function marked `Retry` come back
/// as fresh [`QueuedItem`]s for the caller to push back onto the queue.
async fn run_batch<In, Out>(
    items: Vec<QueuedItem<In, Out>>,
    generator: &Arc<BatchFn<In, Out>>,
) -> Vec<QueuedItem<In, Out>>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let expected = items.len();
    let (values, replies): (Vec<In>, Vec<oneshot::Sender<std::result::Result<Out, SharedError>>>) =
        items.into_iter().map(|item| (item.value, item.reply)).unzip();

    let outcome = generator(values).await;
    let results = match outcome {
        Ok(results) if results.len() == expected => results,
        Ok(results) => {
            let err: SharedError = Arc::new(Error::OutputLengthMismatch {
                expected,
                got: results.len(),
            });
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
            return Vec::new();
        }
        Err(e) => {
            let err: SharedError = Arc::new(e);
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
            return Vec::new();
        }
    };

    let mut retries = Vec::new();
    for (reply, result) in replies.into_iter().zip(results) {
        match result {
            ItemResult::Value(v) => {
                let _ = reply.send(Ok(v));
            }
            ItemResult::Failure(e) => {
                let _ = reply.send(Err(Arc::new(e)));
            }
            ItemResult::Retry(value) => {
                retries.push(QueuedItem { value, reply });
            }
        }
    }
    retries
}

/// A handle to a running persistent batcher. Cheap to clone.
#[derive(Clone)]
pub struct PersistentBatcher<In, Out> {
    inner: Arc<BatcherInner<In, Out>>,
    task: TaskHandle<Vec<Option<()>>>,
}

impl<In, Out> PersistentBatcher<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub async fn new(pool: &Pool, opts: PersistentBatchOptions<In, Out>) -> Result<Self> {
        if opts.max_batch_size == 0 {
            return Err(Error::InvalidConfig("max_batch_size must be positive".into()));
        }
        if opts.queuing_thresholds.is_empty() {
            return Err(Error::InvalidConfig("queuing_thresholds must be non-empty".into()));
        }
        if opts.queuing_thresholds.iter().any(|&t| t == 0) {
            return Err(Error::InvalidConfig(
                "queuing_thresholds entries must be positive".into(),
            ));
        }

        let inner = Arc::new(BatcherInner {
            state: Mutex::new(BatcherState {
                queue: VecDeque::new(),
                active_batch_count: 0,
                threshold_deadline: None,
                ended: false,
                force_release: false,
            }),
            notify: Notify::new(),
            max_batch_size: opts.max_batch_size,
            queuing_thresholds: opts.queuing_thresholds,
            queuing_delay: opts.queuing_delay,
        });

        let generator_fn = opts.generator;
        let inner_for_gen = inner.clone();
        let generator: Generator<()> = Box::new(move |_invocation| {
            let inner = inner_for_gen.clone();
            let generator_fn = generator_fn.clone();
            let op: Operation<()> = async move {
                loop {
                    match inner.try_take_ready(Instant::now()) {
                        ReleaseDecision::Ready(items) => {
                            {
                                let mut state = inner.state.lock();
                                state.active_batch_count += 1;
                            }
                            let retries = run_batch(items, &generator_fn).await;
                            {
                                let mut state = inner.state.lock();
                                state.active_batch_count -= 1;
                            }
                            inner.requeue_front(retries);
                            inner.notify.notify_waiters();
                            crate::metrics::record_batch_release();
                            return Ok(None);
                        }
                        ReleaseDecision::Ended => return Ok(None),
                        ReleaseDecision::Wait(None) => {
                            inner.notify.notified().await;
                        }
                        ReleaseDecision::Wait(Some(deadline)) => {
                            tokio::select! {
                                _ = inner.notify.notified() => {}
                                _ = tokio::time::sleep_until(deadline.into()) => {}
                            }
                        }
                    }
                }
            }
            .boxed();
            Some(op)
        });

        let mut task_opts = TaskOptions::new(generator).groups(opts.groups);
        if let Some(limit) = opts.concurrency_limit {
            task_opts = task_opts.concurrency_limit(limit);
        }
        if let Some(limit) = opts.frequency_limit {
            task_opts = task_opts.frequency_limit(limit, opts.frequency_window.unwrap_or(DEFAULT_FREQUENCY_WINDOW));
        }

        let task = pool.add_generic_task(task_opts).await?;
        Ok(Self { inner, task })
    }

    /// Submit one item, resolving once its batch has been processed (or
    /// automatically resubmitted via `ItemResult::Retry` and later
    /// resolved by a subsequent batch). Fails immediately with `TaskEnded`
    /// if `end()` has already been called.
    pub async fn get_result(&self, value: In) -> std::result::Result<Out, SharedError> {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.ended {
                return Err(Arc::new(Error::TaskEnded));
            }
            state.queue.push_back(QueuedItem { value, reply });
        }
        self.inner.record_queue_depth();
        self.inner.notify.notify_waiters();
        rx.await.unwrap_or_else(|_| Err(Arc::new(Error::PoolShutDown)))
    }

    /// Force an immediate release of whatever is currently queued, bypassing
    /// the queuing delay and thresholds (but not the underlying task's
    /// concurrency/frequency limits, which still gate when the release
    /// actually dispatches). A no-op if the queue is currently empty.
    pub fn send(&self) {
        self.inner.force_release();
    }

    /// `true` once `end()` has been called; every subsequent `get_result()`
    /// fails synchronously with `TaskEnded`.
    pub fn is_ended(&self) -> bool {
        self.inner.is_ended()
    }

    /// Number of items waiting to be included in a future batch.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth()
    }

    /// The batcher's task-exclusive group, for adjusting its concurrency
    /// or frequency limits after construction.
    pub fn exclusive_group(&self) -> GroupHandle {
        self.task.exclusive_group()
    }

    pub fn pause(&self) {
        self.task.pause();
    }

    pub fn resume(&self) {
        self.task.resume();
    }

    /// Ends the underlying task and rejects every currently-queued waiter
    /// with `TaskEnded`; every subsequent `get_result()` fails the same way.
    pub fn end(&self) {
        self.inner.end();
        self.task.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn items_batch_up_to_max_size() {
        let pool = Pool::unbounded();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let opts: PersistentBatchOptions<u32, u32> = PersistentBatchOptions::new(move |items: Vec<u32>| {
            c.fetch_add(1, Ordering::SeqCst);
            async move { Ok(items.into_iter().map(|v| ItemResult::Value(v * 2)).collect()) }.boxed()
        })
        .max_batch_size(3)
        .queuing_delay(Duration::from_millis(50));

        let batcher = PersistentBatcher::new(&pool, opts).await.unwrap();
        let a = batcher.get_result(1);
        let b = batcher.get_result(2);
        let c2 = batcher.get_result(3);
        let (ra, rb, rc) = tokio::join!(a, b, c2);
        assert_eq!(ra.unwrap(), 2);
        assert_eq!(rb.unwrap(), 4);
        assert_eq!(rc.unwrap(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_function_error_rejects_every_item_without_ending_task() {
        let pool = Pool::unbounded();
        let opts: PersistentBatchOptions<u32, u32> = PersistentBatchOptions::new(|_items: Vec<u32>| {
            async move { Err(Error::GeneratorFailure("boom".into())) }.boxed()
        })
        .max_batch_size(1);

        let batcher = PersistentBatcher::new(&pool, opts).await.unwrap();
        let err = batcher.get_result(1).await.unwrap_err();
        assert!(matches!(*err, Error::GeneratorFailure(_)));

        // The batcher itself is unaffected; a later item still gets a
        // fresh attempt through the same (still-failing) function.
        let err2 = batcher.get_result(2).await.unwrap_err();
        assert!(matches!(*err2, Error::GeneratorFailure(_)));
    }

    #[tokio::test]
    async fn retry_resubmits_item_into_a_later_batch() {
        let pool = Pool::unbounded();
        let attempt = Arc::new(AtomicUsize::new(0));
        let a = attempt.clone();
        let opts: PersistentBatchOptions<u32, u32> = PersistentBatchOptions::new(move |items: Vec<u32>| {
            let a = a.clone();
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Ok(items.into_iter().map(ItemResult::Retry).collect())
                } else {
                    Ok(items.into_iter().map(|v| ItemResult::Value(v + 100)).collect())
                }
            }
            .boxed()
        })
        .max_batch_size(1);

        let batcher = PersistentBatcher::new(&pool, opts).await.unwrap();
        let result = batcher.get_result(7).await.unwrap();
        assert_eq!(result, 107);
        assert_eq!(attempt.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn send_forces_release_ahead_of_the_queuing_delay() {
        let pool = Pool::unbounded();
        let opts: PersistentBatchOptions<u32, u32> = PersistentBatchOptions::new(|items: Vec<u32>| {
            async move { Ok(items.into_iter().map(|v| ItemResult::Value(v * 2)).collect()) }.boxed()
        })
        .max_batch_size(10)
        .queuing_delay(Duration::from_secs(10));

        let batcher = PersistentBatcher::new(&pool, opts).await.unwrap();
        let pending = batcher.get_result(21);
        // Without forcing, this item would sit in the queue for ten
        // seconds waiting for the delay to elapse.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(batcher.queue_depth(), 1);
        batcher.send();
        let result = tokio::time::timeout(Duration::from_millis(200), pending)
            .await
            .expect("send() should force an immediate release")
            .unwrap();
        assert_eq!(result, 42);
    }
}
