//! The pool scheduler: the single point that, whenever any relevant state
//! changes, re-evaluates every task and drives work forward without
//! re-entering itself, arming one timer for the next future opportunity.
//!
//! All mutable scheduling state (`GroupTable`, the live task table, the
//! re-entrancy flags) is owned exclusively by [`PoolActor`], which runs as a
//! single spawned `tokio` task. Every other part of the crate talks to it
//! through [`Pool`] / [`GroupHandle`] / [`TaskHandle`] — cheap, `Clone`able
//! command senders. This is a direct Rust translation of a single-threaded
//! cooperative scheduling model: there is exactly one place that mutates
//! the schedule, so no lock is needed around it.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant as TokioInstant;
use tracing::warn;

use crate::error::{Error, Result, SharedError};
use crate::group::{BusyTime, GroupOptions, GroupState, GroupTable, DEFAULT_FREQUENCY_WINDOW};
use crate::ids::{GroupId, PoolId, TaskId};
use crate::task::{
    exclusive_group_options, ConcreteTask, DynTask, EventSender, OperationOutcome, TaskOptions,
    TaskState,
};

/// A task's generator is allowed to run synchronously this many times in a
/// row before the scheduler throttles it — guards against a generator
/// that never actually awaits anything.
const SYNCHRONOUS_RUN_THROTTLE: u32 = 100_000;

/// Construction options for a [`Pool`].
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub concurrency_limit: Option<u32>,
    pub frequency_limit: Option<u32>,
    pub frequency_window: Option<Duration>,
}

impl PoolOptions {
    pub fn with_concurrency_limit(limit: u32) -> Self {
        Self {
            concurrency_limit: Some(limit),
            ..Default::default()
        }
    }
}

/// Read-only snapshot of a group's limits and counters, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStats {
    pub concurrency_limit: Option<u32>,
    pub frequency_limit: Option<u32>,
    pub frequency_window: Duration,
    pub active_task_count: u32,
    pub active_promise_count: u32,
    pub free_slots: Option<u32>,
}

/// Read-only snapshot of a task's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    pub state: TaskState,
    pub invocations: u64,
    pub active_promise_count: u32,
    pub free_slots: Option<u32>,
}

type AddTaskBuilder = Box<dyn FnOnce(&mut PoolActor) -> Result<()> + Send>;

enum Command {
    AddGroup {
        opts: GroupOptions,
        reply: oneshot::Sender<Result<GroupId>>,
    },
    AddTask {
        build: AddTaskBuilder,
        reply: oneshot::Sender<Result<()>>,
    },
    Pause(TaskId),
    Resume(TaskId),
    End(TaskId),
    SetInvocationLimit(TaskId, Option<u64>),
    SetConcurrencyLimit {
        group: GroupId,
        limit: Option<u32>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetFrequencyLimit {
        group: GroupId,
        limit: Option<u32>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetFrequencyWindow {
        group: GroupId,
        window: Option<Duration>,
        reply: oneshot::Sender<Result<()>>,
    },
    GroupStats {
        group: GroupId,
        reply: oneshot::Sender<GroupStats>,
    },
    TaskStats {
        task: TaskId,
        reply: oneshot::Sender<Option<TaskStats>>,
    },
    WaitForIdle {
        group: GroupId,
        reply: oneshot::Sender<std::result::Result<(), SharedError>>,
    },
    ClearRejectionTick(GroupId),
    Trigger,
}

/// The scheduler actor. Lives entirely inside one spawned task; every field
/// here is touched only from [`PoolActor::run`].
struct PoolActor {
    pool_id: PoolId,
    global_group: GroupId,
    groups: GroupTable,
    tasks: IndexMap<TaskId, Box<dyn DynTask>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    self_tx: mpsc::UnboundedSender<Command>,
    event_tx: EventSender,
    event_rx: mpsc::UnboundedReceiver<OperationOutcome>,
    triggering: bool,
    trigger_again: bool,
    next_wake: Option<TokioInstant>,
    throttle_warned: bool,
}

async fn sleep_until_opt(deadline: Option<TokioInstant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

impl PoolActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                maybe_outcome = self.event_rx.recv() => {
                    match maybe_outcome {
                        Some(outcome) => self.handle_outcome(outcome),
                        None => break,
                    }
                }
                _ = sleep_until_opt(self.next_wake) => {
                    self.next_wake = None;
                    self.trigger_now();
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddGroup { opts, reply } => {
                let result = GroupState::new(GroupId::next(), self.pool_id, opts)
                    .map(|g| self.groups.insert(g));
                let _ = reply.send(result);
            }
            Command::AddTask { build, reply } => {
                let result = build(self);
                let _ = reply.send(result);
                self.trigger_now();
            }
            Command::Pause(id) => {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.pause();
                }
            }
            Command::Resume(id) => {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.resume(&mut self.groups);
                }
                self.trigger_now();
            }
            Command::End(id) => {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.end(&mut self.groups);
                }
                self.reap_dead_tasks();
                self.trigger_now();
            }
            Command::SetInvocationLimit(id, limit) => {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.set_invocation_limit(limit, &mut self.groups);
                }
                self.reap_dead_tasks();
                self.trigger_now();
            }
            Command::SetConcurrencyLimit { group, limit, reply } => {
                let result = match self.groups.get_mut(group) {
                    Some(g) => g.set_concurrency_limit(limit),
                    None => Ok(()),
                };
                let _ = reply.send(result);
                self.trigger_now();
            }
            Command::SetFrequencyLimit { group, limit, reply } => {
                let result = match self.groups.get_mut(group) {
                    Some(g) => g.set_frequency_limit(limit),
                    None => Ok(()),
                };
                let _ = reply.send(result);
                self.trigger_now();
            }
            Command::SetFrequencyWindow { group, window, reply } => {
                let result = match self.groups.get_mut(group) {
                    Some(g) => g.set_frequency_window(window),
                    None => Ok(()),
                };
                let _ = reply.send(result);
                self.trigger_now();
            }
            Command::GroupStats { group, reply } => {
                let now = std::time::Instant::now();
                let stats = match self.groups.get_mut(group) {
                    Some(g) => GroupStats {
                        concurrency_limit: g.concurrency_limit(),
                        frequency_limit: g.frequency_limit(),
                        frequency_window: g.frequency_window(),
                        active_task_count: g.active_task_count(),
                        active_promise_count: g.active_promise_count(),
                        free_slots: g.free_slots(now),
                    },
                    None => GroupStats {
                        concurrency_limit: None,
                        frequency_limit: None,
                        frequency_window: DEFAULT_FREQUENCY_WINDOW,
                        active_task_count: 0,
                        active_promise_count: 0,
                        free_slots: None,
                    },
                };
                let _ = reply.send(stats);
            }
            Command::TaskStats { task, reply } => {
                let now = std::time::Instant::now();
                let stats = self.tasks.get_mut(&task).map(|t| TaskStats {
                    state: t.state(),
                    invocations: t.invocations(),
                    active_promise_count: self.groups.active_promise_count(t.exclusive_group()),
                    free_slots: t.free_slots(&mut self.groups, now),
                });
                let _ = reply.send(stats);
            }
            Command::WaitForIdle { group, reply } => {
                if let Some(g) = self.groups.get_mut(group) {
                    g.wait_for_idle(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            Command::ClearRejectionTick(group) => {
                self.groups.clear_recent_rejection_tick(group);
            }
            Command::Trigger => self.trigger_now(),
        }
    }

    fn handle_outcome(&mut self, outcome: OperationOutcome) {
        let needs_tick = match self.tasks.get_mut(&outcome.task_id) {
            Some(task) => task.complete_operation(&mut self.groups, outcome.result_index, outcome.outcome),
            None => Vec::new(),
        };
        for group in needs_tick {
            self.schedule_rejection_clear_tick(group);
        }
        self.reap_dead_tasks();
        self.trigger_now();
    }

    /// The one-tick grace: a rejection is only cleared (or left sticky)
    /// one micro-tick after it first lands, so downstream code has a
    /// chance to install a `wait_for_idle` that observes it.
    fn schedule_rejection_clear_tick(&self, group: GroupId) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = tx.send(Command::ClearRejectionTick(group));
        });
    }

    fn reap_dead_tasks(&mut self) {
        self.tasks.retain(|_, task| task.is_live(&self.groups));
    }

    /// Re-entrancy guarded, insertion-order sweep over every live task.
    fn trigger_now(&mut self) {
        if self.triggering {
            self.trigger_again = true;
            return;
        }
        self.triggering = true;
        loop {
            self.trigger_again = false;
            let soonest = self.sweep();
            if self.trigger_again {
                continue;
            }
            self.arm_wake(soonest);
            break;
        }
        self.triggering = false;
    }

    fn sweep(&mut self) -> BusyTime {
        let now = std::time::Instant::now();
        let mut soonest = BusyTime::Saturated;

        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            loop {
                let Some(task) = self.tasks.get_mut(&id) else { break };
                match task.busy_time(&mut self.groups, now) {
                    BusyTime::Ready => {
                        if !task.run(&mut self.groups, now, &self.event_tx) {
                            break;
                        }
                        let active = self.groups.active_promise_count(task.exclusive_group());
                        if active > SYNCHRONOUS_RUN_THROTTLE {
                            self.warn_throttle_once(id);
                            soonest = BusyTime::Ready;
                            break;
                        }
                    }
                    other => {
                        soonest = soonest.earliest(other);
                        break;
                    }
                }
            }
        }

        self.reap_dead_tasks();
        let active_ops = self.groups.active_promise_count(self.global_group);
        crate::metrics::set_active_tasks(self.pool_id.raw(), self.tasks.len() as u32);
        crate::metrics::set_active_operations(self.pool_id.raw(), active_ops);
        soonest
    }

    fn warn_throttle_once(&mut self, task: TaskId) {
        if !self.throttle_warned {
            self.throttle_warned = true;
            warn!(
                task_id = ?task,
                limit = SYNCHRONOUS_RUN_THROTTLE,
                "task generator produced synchronous operations without yielding; throttling to let other tasks advance"
            );
        }
        crate::metrics::record_throttle_event();
    }

    fn arm_wake(&mut self, soonest: BusyTime) {
        self.next_wake = match soonest {
            BusyTime::Ready => Some(TokioInstant::now()),
            BusyTime::Saturated => None,
            BusyTime::At(instant) => Some(TokioInstant::from_std(instant)),
        };
    }
}

/// A pool of tasks sharing a global concurrency/frequency budget. Cheap to
/// clone; every clone talks to the same actor.
#[derive(Clone)]
pub struct Pool {
    id: PoolId,
    global_group: GroupId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Pool {
    pub fn new(opts: PoolOptions) -> Result<Self> {
        let pool_id = PoolId::next();
        let global_group_id = GroupId::next();
        let mut groups = GroupTable::default();
        let global_group = GroupState::new(
            global_group_id,
            pool_id,
            GroupOptions {
                concurrency_limit: opts.concurrency_limit,
                frequency_limit: opts.frequency_limit,
                frequency_window: opts.frequency_window,
            },
        )?;
        groups.insert(global_group);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = PoolActor {
            pool_id,
            global_group: global_group_id,
            groups,
            tasks: IndexMap::new(),
            cmd_rx,
            self_tx: cmd_tx.clone(),
            event_tx,
            event_rx,
            triggering: false,
            trigger_again: false,
            next_wake: None,
            throttle_warned: false,
        };
        tokio::spawn(actor.run());

        Ok(Pool {
            id: pool_id,
            global_group: global_group_id,
            cmd_tx,
        })
    }

    /// Pool with every limit defaulted to unbounded.
    pub fn unbounded() -> Self {
        Self::new(PoolOptions::default()).expect("default pool options are always valid")
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    fn send(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// Add a new limit bucket that tasks can be affiliated with in addition
    /// to the pool's global group and their own exclusive group.
    pub async fn add_group(&self, opts: GroupOptions) -> Result<GroupHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AddGroup { opts, reply });
        let id = rx.await.map_err(|_| Error::PoolShutDown)??;
        Ok(GroupHandle {
            id,
            pool_id: self.id,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Register a generic task. `opts.groups` must already belong to this
    /// pool or construction fails with [`Error::CrossPoolGroup`].
    pub async fn add_generic_task<T, Out>(&self, opts: TaskOptions<T, Out>) -> Result<TaskHandle<Out>>
    where
        T: Send + 'static,
        Out: Send + Sync + 'static,
    {
        let task_id = TaskId::next();
        let exclusive_group_id = GroupId::next();
        let pool_id = self.id;
        let (completion_tx, completion_rx) = watch::channel(None);
        let user_group_ids = opts.groups.clone();

        let build: AddTaskBuilder = Box::new(move |actor: &mut PoolActor| {
            for gid in &user_group_ids {
                match actor.groups.get(*gid) {
                    Some(g) if g.pool_id() == pool_id => {}
                    _ => return Err(Error::CrossPoolGroup),
                }
            }

            let exclusive_opts = exclusive_group_options(&opts);
            let exclusive_group = GroupState::new(exclusive_group_id, pool_id, exclusive_opts)?;
            actor.groups.insert(exclusive_group);

            let mut group_ids = vec![actor.global_group, exclusive_group_id];
            group_ids.extend(user_group_ids.iter().copied());

            let task = ConcreteTask::new(
                task_id,
                exclusive_group_id,
                group_ids,
                opts,
                &mut actor.groups,
                completion_tx,
            )?;

            if task.is_live(&actor.groups) {
                actor.tasks.insert(task_id, Box::new(task));
            }
            Ok(())
        });

        let (reply, rx) = oneshot::channel();
        self.send(Command::AddTask { build, reply });
        rx.await.map_err(|_| Error::PoolShutDown)??;

        Ok(TaskHandle {
            id: task_id,
            pool_id,
            exclusive_group: exclusive_group_id,
            cmd_tx: self.cmd_tx.clone(),
            completion_rx,
        })
    }

    pub async fn wait_for_idle(&self) -> std::result::Result<(), SharedError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::WaitForIdle {
            group: self.global_group,
            reply,
        });
        rx.await.unwrap_or(Ok(()))
    }

    pub async fn stats(&self) -> GroupStats {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupStats {
            group: self.global_group,
            reply,
        });
        rx.await.unwrap_or(GroupStats {
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: DEFAULT_FREQUENCY_WINDOW,
            active_task_count: 0,
            active_promise_count: 0,
            free_slots: None,
        })
    }

    pub async fn set_concurrency_limit(&self, limit: Option<u32>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetConcurrencyLimit {
            group: self.global_group,
            limit,
            reply,
        });
        rx.await.map_err(|_| Error::PoolShutDown)?
    }

    pub async fn set_frequency_limit(&self, limit: Option<u32>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetFrequencyLimit {
            group: self.global_group,
            limit,
            reply,
        });
        rx.await.map_err(|_| Error::PoolShutDown)?
    }

    pub async fn set_frequency_window(&self, window: Option<Duration>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetFrequencyWindow {
            group: self.global_group,
            window,
            reply,
        });
        rx.await.map_err(|_| Error::PoolShutDown)?
    }

    /// The pool's own `GroupHandle` view of its global group, for code that
    /// wants to treat the pool uniformly alongside user groups — the pool
    /// itself is also a group.
    pub fn as_group(&self) -> GroupHandle {
        GroupHandle {
            id: self.global_group,
            pool_id: self.id,
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

/// A handle to one limit bucket. Cheap to clone.
#[derive(Clone)]
pub struct GroupHandle {
    id: GroupId,
    pool_id: PoolId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl GroupHandle {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    fn send(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub async fn stats(&self) -> GroupStats {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GroupStats { group: self.id, reply });
        rx.await.unwrap_or(GroupStats {
            concurrency_limit: None,
            frequency_limit: None,
            frequency_window: DEFAULT_FREQUENCY_WINDOW,
            active_task_count: 0,
            active_promise_count: 0,
            free_slots: None,
        })
    }

    pub async fn set_concurrency_limit(&self, limit: Option<u32>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetConcurrencyLimit {
            group: self.id,
            limit,
            reply,
        });
        rx.await.map_err(|_| Error::PoolShutDown)?
    }

    pub async fn set_frequency_limit(&self, limit: Option<u32>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetFrequencyLimit {
            group: self.id,
            limit,
            reply,
        });
        rx.await.map_err(|_| Error::PoolShutDown)?
    }

    pub async fn set_frequency_window(&self, window: Option<Duration>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetFrequencyWindow {
            group: self.id,
            window,
            reply,
        });
        rx.await.map_err(|_| Error::PoolShutDown)?
    }

    pub async fn wait_for_idle(&self) -> std::result::Result<(), SharedError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::WaitForIdle { group: self.id, reply });
        rx.await.unwrap_or(Ok(()))
    }
}

/// A handle to one task's lifecycle and completion. `Out` is the task's
/// final result type (the raw per-invocation vector unless a result
/// converter was supplied).
pub struct TaskHandle<Out> {
    id: TaskId,
    pool_id: PoolId,
    exclusive_group: GroupId,
    cmd_tx: mpsc::UnboundedSender<Command>,
    completion_rx: watch::Receiver<Option<std::result::Result<Arc<Out>, SharedError>>>,
}

impl<Out> Clone for TaskHandle<Out> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            pool_id: self.pool_id,
            exclusive_group: self.exclusive_group,
            cmd_tx: self.cmd_tx.clone(),
            completion_rx: self.completion_rx.clone(),
        }
    }
}

impl<Out> TaskHandle<Out> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task-exclusive group — exactly one per task — lets callers
    /// adjust this task's own limits after construction the same way they
    /// would any user-supplied group.
    pub fn exclusive_group(&self) -> GroupHandle {
        GroupHandle {
            id: self.exclusive_group,
            pool_id: self.pool_id,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    fn send(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn pause(&self) {
        self.send(Command::Pause(self.id));
    }

    pub fn resume(&self) {
        self.send(Command::Resume(self.id));
    }

    pub fn end(&self) {
        self.send(Command::End(self.id));
    }

    pub fn set_invocation_limit(&self, limit: Option<u64>) {
        self.send(Command::SetInvocationLimit(self.id, limit));
    }

    pub async fn stats(&self) -> Option<TaskStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TaskStats { task: self.id, reply });
        rx.await.ok().flatten()
    }

    /// Resolves once the task reaches `Terminated`, yielding its converted
    /// result or its sticky rejection.
    pub async fn promise(&self) -> std::result::Result<Arc<Out>, SharedError> {
        let mut rx = self.completion_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Actor dropped the sender without ever resolving — only
                // possible if the pool itself was torn down.
                return Err(Arc::new(Error::PoolShutDown));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Generator, Operation, TaskOptions};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration as StdDuration;

    fn immediate<T: Send + 'static>(value: T) -> Operation<T> {
        futures::future::ready(Ok(Some(value))).boxed()
    }

    #[tokio::test]
    async fn single_operation_completes() {
        let pool = Pool::unbounded();
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        let generator: Generator<u32> = Box::new(move |i| {
            if i == 0 {
                c.fetch_add(1, Ordering::SeqCst);
                Some(immediate(42))
            } else {
                None
            }
        });
        let task = pool
            .add_generic_task(TaskOptions::new(generator))
            .await
            .unwrap();
        let result = task.promise().await.unwrap();
        assert_eq!(result.as_slice(), &[Some(42)]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invocation_limit_bounds_results() {
        let pool = Pool::unbounded();
        let generator: Generator<u32> = Box::new(|i| Some(immediate(i as u32)));
        let task = pool
            .add_generic_task(TaskOptions::new(generator).invocation_limit(3))
            .await
            .unwrap();
        let result = task.promise().await.unwrap();
        assert_eq!(result.as_slice(), &[Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn zero_invocation_limit_terminates_immediately_with_empty_result() {
        let pool = Pool::unbounded();
        let generator: Generator<u32> = Box::new(|_| Some(immediate(1)));
        let task = pool
            .add_generic_task(TaskOptions::new(generator).invocation_limit(0))
            .await
            .unwrap();
        let result = task.promise().await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn concurrency_limit_serializes_operations() {
        let pool = Pool::unbounded();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let started = Arc::new(AtomicU64::new(0));
        let o = order.clone();
        let s = started.clone();
        let generator: Generator<()> = Box::new(move |i| {
            if i >= 3 {
                return None;
            }
            let o = o.clone();
            let s = s.clone();
            Some(
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(5)).await;
                    o.lock().push(i);
                    Ok(Some(()))
                }
                .boxed(),
            )
        });
        let task = pool
            .add_generic_task(TaskOptions::new(generator).concurrency_limit(1))
            .await
            .unwrap();
        task.promise().await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn generator_failure_becomes_sticky_rejection() {
        let pool = Pool::unbounded();
        let generator: Generator<()> = Box::new(|i| {
            if i == 0 {
                Some(futures::future::ready(Err(Error::GeneratorFailure("boom".into()))).boxed())
            } else {
                None
            }
        });
        let task = pool.add_generic_task(TaskOptions::new(generator)).await.unwrap();
        let err = task.promise().await.unwrap_err();
        assert!(matches!(*err, Error::GeneratorFailure(_)));
        // Second observation sees the same sticky failure.
        let err2 = task.promise().await.unwrap_err();
        assert!(matches!(*err2, Error::GeneratorFailure(_)));
    }

    #[tokio::test]
    async fn paused_task_stays_paused_on_nullish_generator() {
        let pool = Pool::unbounded();
        let generator: Generator<()> = Box::new(|_| None);
        let task = pool
            .add_generic_task(TaskOptions::new(generator).paused())
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let stats = task.stats().await.unwrap();
        assert_eq!(stats.state, TaskState::Paused);
    }

    #[tokio::test]
    async fn group_wait_for_idle_resolves_after_completion() {
        let pool = Pool::unbounded();
        let group = pool.add_group(GroupOptions::default()).await.unwrap();
        let gid = group.id();
        let generator: Generator<()> = Box::new(|i| if i == 0 { Some(immediate(())) } else { None });
        pool.add_generic_task(TaskOptions::new(generator).groups(vec![gid]))
            .await
            .unwrap();
        group.wait_for_idle().await.unwrap();
    }

    #[tokio::test]
    async fn cross_pool_group_is_rejected() {
        let pool_a = Pool::unbounded();
        let pool_b = Pool::unbounded();
        let foreign_group = pool_b.add_group(GroupOptions::default()).await.unwrap();
        let generator: Generator<()> = Box::new(|_| None);
        let err = pool_a
            .add_generic_task(TaskOptions::new(generator).groups(vec![foreign_group.id()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CrossPoolGroup));
    }
}
