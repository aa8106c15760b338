//! The task engine: a generator-driven producer that pulls new operations
//! under its own and its groups' limits, tracks completion, aggregates
//! results, and reports terminal status.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result, SharedError};
use crate::group::{BusyTime, GroupOptions, GroupState, GroupTable};
use crate::ids::{GroupId, TaskId};

/// The value produced by one invocation of a task's generator, or `None`
/// when the invocation yields no value.
pub type Operation<T> = BoxFuture<'static, std::result::Result<Option<T>, Error>>;

/// `(invocation index) -> next operation, or nothing`.
///
/// A `None` return ends the task (unless it is currently `Paused`, in which
/// case the task just stays paused). Producing an
/// already-resolved value is expressed as
/// `futures::future::ready(Ok(Some(v))).boxed()`; there is no separate
/// "immediate value" variant because Rust has no untyped thenable check —
/// every return is already a concrete future.
pub type Generator<T> = Box<dyn FnMut(u64) -> Option<Operation<T>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Active,
    Paused,
    Exhausted,
    Terminated,
}

/// Construction options for a generic task.
pub struct TaskOptions<T, Out = Vec<Option<T>>> {
    pub generator: Generator<T>,
    pub invocation_limit: Option<u64>,
    pub concurrency_limit: Option<u32>,
    pub frequency_limit: Option<u32>,
    pub frequency_window: Option<Duration>,
    pub groups: Vec<GroupId>,
    pub paused: bool,
    pub(crate) result_converter:
        Box<dyn FnOnce(Vec<Option<T>>) -> std::result::Result<Out, Error> + Send>,
}

impl<T: Send + 'static> TaskOptions<T, Vec<Option<T>>> {
    /// A task with no result conversion: the final result is the raw,
    /// invocation-indexed, `invocations`-length vector.
    pub fn new(generator: Generator<T>) -> Self {
        Self {
            generator,
            invocation_limit: None,
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: None,
            groups: Vec::new(),
            paused: false,
            result_converter: Box::new(Ok),
        }
    }

    /// Attach a one-shot converter, changing the task's final result type.
    pub fn with_result_converter<Out>(
        self,
        converter: impl FnOnce(Vec<Option<T>>) -> std::result::Result<Out, Error> + Send + 'static,
    ) -> TaskOptions<T, Out> {
        TaskOptions {
            generator: self.generator,
            invocation_limit: self.invocation_limit,
            concurrency_limit: self.concurrency_limit,
            frequency_limit: self.frequency_limit,
            frequency_window: self.frequency_window,
            groups: self.groups,
            paused: self.paused,
            result_converter: Box::new(converter),
        }
    }
}

impl<T, Out> TaskOptions<T, Out> {
    pub fn invocation_limit(mut self, limit: u64) -> Self {
        self.invocation_limit = Some(limit);
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

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }
}

/// Message the pool actor delivers to itself once a spawned operation
/// settles. The outcome is type-erased because the actor's task table holds
/// heterogeneous `Box<dyn DynTask>` entries; `ConcreteTask::complete_operation`
/// downcasts it back to `Result<Option<T>, Error>`.
pub struct OperationOutcome {
    pub task_id: TaskId,
    pub result_index: u64,
    pub outcome: Box<dyn Any + Send>,
}

pub type EventSender = mpsc::UnboundedSender<OperationOutcome>;

/// Object-safe face of a task, used by the pool actor so it can drive tasks
/// of different result types through one insertion-ordered table — tasks
/// are advanced in insertion order.
pub(crate) trait DynTask: Send {
    fn id(&self) -> TaskId;
    fn group_ids(&self) -> &[GroupId];
    fn exclusive_group(&self) -> GroupId;
    fn state(&self) -> TaskState;
    fn invocations(&self) -> u64;
    /// True while the task could still produce operations or has operations
    /// outstanding — the pool's live-task-set membership test.
    fn is_live(&self, groups: &GroupTable) -> bool;
    fn busy_time(&mut self, groups: &mut GroupTable, now: Instant) -> BusyTime;
    /// `min` of the task's own remaining-invocation headroom and every
    /// affiliated group's free-slot count.
    fn free_slots(&self, groups: &mut GroupTable, now: Instant) -> Option<u32>;
    /// Pull one operation from the generator and, if one was produced, spawn
    /// it and wire its completion back through `events`. Returns whether an
    /// operation was actually started.
    fn run(&mut self, groups: &mut GroupTable, now: Instant, events: &EventSender) -> bool;
    /// Returns group ids needing a deferred rejection-clear tick (non-empty
    /// only when this operation's failure newly established the task's
    /// sticky rejection).
    fn complete_operation(
        &mut self,
        groups: &mut GroupTable,
        result_index: u64,
        outcome: Box<dyn Any + Send>,
    ) -> Vec<GroupId>;
    fn pause(&mut self);
    fn resume(&mut self, groups: &mut GroupTable) -> bool;
    fn end(&mut self, groups: &mut GroupTable);
    fn set_invocation_limit(&mut self, limit: Option<u64>, groups: &mut GroupTable);
}

pub(crate) struct ConcreteTask<T, Out> {
    id: TaskId,
    generator: Generator<T>,
    group_ids: Vec<GroupId>,
    exclusive_group: GroupId,
    invocations: u64,
    invocation_limit: Option<u64>,
    state: TaskState,
    results: BTreeMap<u64, T>,
    result_converter: Option<Box<dyn FnOnce(Vec<Option<T>>) -> std::result::Result<Out, Error> + Send>>,
    rejection: Option<SharedError>,
    generating: bool,
    completion_tx: watch::Sender<Option<std::result::Result<Arc<Out>, SharedError>>>,
}

impl<T: Send + 'static, Out: Send + Sync + 'static> ConcreteTask<T, Out> {
    pub fn new(
        id: TaskId,
        exclusive_group: GroupId,
        group_ids: Vec<GroupId>,
        opts: TaskOptions<T, Out>,
        groups: &mut GroupTable,
        completion_tx: watch::Sender<Option<std::result::Result<Arc<Out>, SharedError>>>,
    ) -> Result<Self> {
        if let Some(limit) = opts.concurrency_limit {
            groups.get_mut(exclusive_group).unwrap().set_concurrency_limit(Some(limit))?;
        }
        if opts.frequency_limit.is_some() {
            let g = groups.get_mut(exclusive_group).unwrap();
            g.set_frequency_limit(opts.frequency_limit)?;
            g.set_frequency_window(opts.frequency_window)?;
        }
        groups.increment_task_count_all(&group_ids);

        let state = if opts.paused { TaskState::Paused } else { TaskState::Active };
        let mut task = Self {
            id,
            generator: opts.generator,
            group_ids,
            exclusive_group,
            invocations: 0,
            invocation_limit: opts.invocation_limit,
            state,
            results: BTreeMap::new(),
            result_converter: Some(opts.result_converter),
            rejection: None,
            generating: false,
            completion_tx,
        };

        if let Some(0) = task.invocation_limit {
            task.end(groups);
        }
        Ok(task)
    }

    fn deliver_result(&mut self) {
        if let Some(err) = self.rejection.clone() {
            let _ = self.completion_tx.send(Some(Err(err)));
            return;
        }
        let mut flat = Vec::with_capacity(self.invocations as usize);
        for i in 0..self.invocations {
            flat.push(self.results.remove(&i));
        }
        match self.result_converter.take().map(|f| f(flat)) {
            Some(Ok(out)) => {
                let _ = self.completion_tx.send(Some(Ok(Arc::new(out))));
            }
            Some(Err(e)) => {
                let shared = Arc::new(e);
                self.rejection = Some(shared.clone());
                let _ = self.completion_tx.send(Some(Err(shared)));
            }
            None => {
                // deliver_result called twice; result already sent once. No-op.
            }
        }
    }

    fn terminate(&mut self, groups: &mut GroupTable) {
        self.state = TaskState::Terminated;
        groups.decrement_task_count_all(&self.group_ids);
        self.deliver_result();
    }

    /// Returns the group ids that need a deferred "next micro-tick" clear
    /// scheduled by the caller (the one-tick grace window before a fresh
    /// rejection becomes non-recent) — empty if this failure coalesced
    /// onto an already-sticky rejection.
    fn reject_internal(&mut self, groups: &mut GroupTable, error: Error) -> Vec<GroupId> {
        if self.rejection.is_some() {
            debug!(task_id = ?self.id, %error, "task already rejected, dropping secondary failure");
            return Vec::new();
        }
        crate::metrics::record_generator_failure();
        let shared: SharedError = Arc::new(error);
        self.rejection = Some(shared.clone());
        self.end(groups);
        let _ = self.completion_tx.send(Some(Err(shared.clone())));
        groups.reject_all(&self.group_ids, shared)
    }
}

impl<T: Send + 'static, Out: Send + Sync + 'static> DynTask for ConcreteTask<T, Out> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn group_ids(&self) -> &[GroupId] {
        &self.group_ids
    }

    fn exclusive_group(&self) -> GroupId {
        self.exclusive_group
    }

    fn state(&self) -> TaskState {
        self.state
    }

    fn invocations(&self) -> u64 {
        self.invocations
    }

    fn is_live(&self, groups: &GroupTable) -> bool {
        self.state < TaskState::Terminated || groups.active_promise_count(self.exclusive_group) > 0
    }

    fn busy_time(&mut self, groups: &mut GroupTable, now: Instant) -> BusyTime {
        if self.state != TaskState::Active {
            return BusyTime::Saturated;
        }
        groups.busy_time_across(&self.group_ids, now)
    }

    fn free_slots(&self, groups: &mut GroupTable, now: Instant) -> Option<u32> {
        let own = self.invocation_limit.map(|limit| {
            limit.saturating_sub(self.invocations).min(u32::MAX as u64) as u32
        });
        let group_slots = groups.free_slots_across(&self.group_ids, now);
        match (own, group_slots) {
            (None, x) | (x, None) => x,
            (Some(a), Some(b)) => Some(a.min(b)),
        }
    }

    fn run(&mut self, groups: &mut GroupTable, now: Instant, events: &EventSender) -> bool {
        if self.state != TaskState::Active || self.generating {
            return false;
        }
        self.generating = true;
        let next = (self.generator)(self.invocations);
        self.generating = false;

        let Some(operation) = next else {
            if self.state != TaskState::Paused {
                self.end(groups);
            }
            return false;
        };

        groups.record_start_all(&self.group_ids, now);
        let result_index = self.invocations;
        self.invocations += 1;
        if let Some(limit) = self.invocation_limit {
            if self.invocations >= limit {
                self.end(groups);
            }
        }

        let task_id = self.id;
        let tx = events.clone();
        tokio::spawn(async move {
            let outcome = operation.await;
            let _ = tx.send(OperationOutcome {
                task_id,
                result_index,
                outcome: Box::new(outcome),
            });
        });
        true
    }

    fn complete_operation(
        &mut self,
        groups: &mut GroupTable,
        result_index: u64,
        outcome: Box<dyn Any + Send>,
    ) -> Vec<GroupId> {
        groups.record_complete_all(&self.group_ids);
        let outcome = *outcome
            .downcast::<std::result::Result<Option<T>, Error>>()
            .expect("type-erased operation outcome type mismatch");
        match outcome {
            Ok(value) => {
                if let Some(v) = value {
                    if self.result_converter.is_some() {
                        self.results.insert(result_index, v);
                    }
                }
                if self.state >= TaskState::Exhausted
                    && groups.active_promise_count(self.exclusive_group) == 0
                {
                    self.end(groups);
                }
                Vec::new()
            }
            Err(e) => self.reject_internal(groups, e),
        }
    }

    fn pause(&mut self) {
        if self.state == TaskState::Active {
            self.state = TaskState::Paused;
        }
    }

    fn resume(&mut self, _groups: &mut GroupTable) -> bool {
        if self.state == TaskState::Paused {
            self.state = TaskState::Active;
            true
        } else {
            false
        }
    }

    fn end(&mut self, groups: &mut GroupTable) {
        if self.state < TaskState::Exhausted {
            self.state = TaskState::Exhausted;
        }
        if !self.generating
            && self.state < TaskState::Terminated
            && groups.active_promise_count(self.exclusive_group) == 0
        {
            self.terminate(groups);
        }
    }

    fn set_invocation_limit(&mut self, limit: Option<u64>, groups: &mut GroupTable) {
        if self.state >= TaskState::Exhausted {
            // Raising the limit on an Exhausted task is a no-op; Exhausted
            // is terminal except for drainage of already-outstanding work.
            return;
        }
        self.invocation_limit = limit;
        if let Some(l) = limit {
            if self.invocations >= l {
                self.end(groups);
            }
        }
    }
}

/// Construction parameters for a task-exclusive group (always created
/// alongside the task, exactly one per task).
pub(crate) fn exclusive_group_options<T, Out>(opts: &TaskOptions<T, Out>) -> GroupOptions {
    GroupOptions {
        concurrency_limit: opts.concurrency_limit,
        frequency_limit: opts.frequency_limit,
        frequency_window: opts.frequency_window,
    }
}

