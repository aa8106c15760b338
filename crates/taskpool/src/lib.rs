//! Cooperative concurrency/frequency scheduler for async work units.
//!
//! - `group`: the limit engine — one `{concurrency, frequency}` budget plus
//!   a sticky rejection, shared by any number of tasks.
//! - `task`: the generator-driven task engine built on top of one or more
//!   groups.
//! - `pool`: the scheduler actor that owns every group and task and
//!   advances them without re-entering itself (`Pool`, `GroupHandle`,
//!   `TaskHandle`).
//! - `batch`: a persistent batcher built from the generic task engine,
//!   accumulating individually-submitted items into released batches.
//! - `specializations`: thin single/linear/each/batch helpers over the
//!   generic task constructor.

pub mod batch;
pub mod error;
pub mod group;
mod ids;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod specializations;
pub mod task;

pub use batch::{BatchFn, ItemResult, PersistentBatchOptions, PersistentBatcher};
pub use error::{Error, Result, SharedError};
pub use group::{BusyTime, GroupOptions};
pub use ids::{GroupId, PoolId, TaskId};
pub use pool::{GroupHandle, GroupStats, Pool, PoolOptions, TaskHandle, TaskStats};
pub use specializations::{add_batch_task, add_each_task, add_linear_task, add_single_task, BatchSize};
pub use task::{Generator, Operation, TaskOptions, TaskState};
