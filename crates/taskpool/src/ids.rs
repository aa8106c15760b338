//! Identity types for groups and tasks.
//!
//! Both are opaque, cheaply-`Copy`-able handles into the pool actor's
//! internal tables. Equality is by identity, never by configuration, which
//! is what cross-pool validation relies on one level up: a group is
//! foreign to a pool iff its `PoolId` doesn't match, never by comparing
//! configured limits.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

impl GroupId {
    pub(crate) fn next() -> Self {
        Self(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of the pool that owns a group, used to reject foreign groups
/// at task-construction time with `CrossPoolGroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolId(u64);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

impl PoolId {
    pub(crate) fn next() -> Self {
        Self(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}
