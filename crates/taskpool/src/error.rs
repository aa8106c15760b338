//! Error kinds surfaced by the scheduler, the task engine, and the batcher.

use std::sync::Arc;
use thiserror::Error;

/// Symbolic error kinds from the group/task/pool/batcher contracts.
///
/// Configuration errors (`InvalidConfig`, `CrossPoolGroup`) are raised
/// synchronously to the caller of the offending constructor or setter.
/// Operational errors (`GeneratorFailure`, `ConverterFailure`) become a
/// task's sticky rejection and are wrapped in [`Arc`] so the same failure
/// can be observed by a completion waiter, a group's `wait_for_idle`, and
/// the unhandled-rejection bookkeeping without cloning the payload.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("group belongs to a different pool")]
    CrossPoolGroup,

    #[error("generator failed: {0}")]
    GeneratorFailure(String),

    #[error("result converter failed: {0}")]
    ConverterFailure(String),

    #[error("task has already ended")]
    TaskEnded,

    #[error("batch output length {got} does not match input length {expected}")]
    OutputLengthMismatch { expected: usize, got: usize },

    #[error("pool has been shut down")]
    PoolShutDown,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A retained failure, shared by every waiter and group that might observe it.
///
/// This is the Rust stand-in for a "sticky rejection" / "failing promise":
/// many parties may hold a clone of the same [`Arc<Error>`], but only the
/// first one to arrive created it.
pub type SharedError = Arc<Error>;
