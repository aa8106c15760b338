//! Specialization helpers: thin wrappers over [`Pool::add_generic_task`]
//! for the common generator shapes (run once, run serialized, run one per
//! input element, run in chunks). Each is expressed purely in terms of the
//! generic task engine — none of them need their own scheduling path.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::pool::{Pool, TaskHandle};
use crate::task::{Generator, Operation, TaskOptions};

/// One invocation; the final result is invocation 0's value (or `None` if
/// it produced none) rather than a one-element vector.
pub async fn add_single_task<T, F>(pool: &Pool, operation: F) -> Result<TaskHandle<Option<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> Operation<T> + Send + 'static,
{
    let mut operation = Some(operation);
    let generator: Generator<T> = Box::new(move |invocation| {
        if invocation == 0 {
            operation.take().map(|f| f())
        } else {
            None
        }
    });

    let opts = TaskOptions::new(generator)
        .invocation_limit(1)
        .with_result_converter(|mut results: Vec<Option<T>>| Ok(results.pop().flatten()));

    pool.add_generic_task(opts).await
}

/// Forces `concurrency_limit = 1`; every other option (frequency,
/// invocation limit, groups) is forwarded unchanged.
pub async fn add_linear_task<T, Out>(pool: &Pool, opts: TaskOptions<T, Out>) -> Result<TaskHandle<Out>>
where
    T: Send + 'static,
    Out: Send + Sync + 'static,
{
    pool.add_generic_task(opts.concurrency_limit(1)).await
}

/// One operation per element of `items`; the task ends once the last
/// element has been dispatched.
pub async fn add_each_task<T, I, F>(pool: &Pool, items: Vec<I>, mut make_operation: F) -> Result<TaskHandle<Vec<Option<T>>>>
where
    T: Send + 'static,
    I: Send + 'static,
    F: FnMut(I) -> Operation<T> + Send + 'static,
{
    let mut remaining: VecDeque<I> = items.into();
    let generator: Generator<T> = Box::new(move |_invocation| remaining.pop_front().map(&mut make_operation));
    pool.add_generic_task(TaskOptions::new(generator)).await
}

/// How a [`add_batch_task`] generator decides the size of its next
/// sub-batch.
pub enum BatchSize {
    Fixed(usize),
    /// `(remaining, free_slots) -> size`. `free_slots` is always `None`
    /// here: the generator contract passes only the invocation index, so
    /// the task-exclusive group's live free-slot count is not threaded
    /// through on a per-invocation basis — see `DESIGN.md`.
    Dynamic(Box<dyn FnMut(usize, Option<u32>) -> std::result::Result<usize, Error> + Send>),
}

/// Groups `items` into sub-sequences dispatched as successive operations.
/// A [`BatchSize::Dynamic`] function returning a non-positive size becomes
/// an `InvalidConfig` failure on that specific invocation, not a crate-wide
/// panic.
pub async fn add_batch_task<T, I, F>(
    pool: &Pool,
    items: Vec<I>,
    mut batch_size: BatchSize,
    mut make_operation: F,
) -> Result<TaskHandle<Vec<Option<T>>>>
where
    T: Send + 'static,
    I: Send + 'static,
    F: FnMut(Vec<I>) -> Operation<T> + Send + 'static,
{
    let mut remaining: VecDeque<I> = items.into();
    let generator: Generator<T> = Box::new(move |_invocation| {
        if remaining.is_empty() {
            return None;
        }
        let size = match &mut batch_size {
            BatchSize::Fixed(n) => Ok(*n),
            BatchSize::Dynamic(f) => f(remaining.len(), None),
        };
        let size = match size {
            Ok(n) if n > 0 => n,
            Ok(_) | Err(_) => {
                use futures::FutureExt;
                return Some(
                    futures::future::ready(Err(Error::InvalidConfig(
                        "batch size function returned a non-positive size".into(),
                    )))
                    .boxed(),
                );
            }
        };
        let take = size.min(remaining.len());
        let chunk: Vec<I> = remaining.drain(..take).collect();
        Some(make_operation(chunk))
    });
    pool.add_generic_task(TaskOptions::new(generator)).await
}
