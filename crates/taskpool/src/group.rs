//! The group limit engine: one set of {concurrency, frequency} limits plus
//! the bookkeeping needed to answer "busy until when?".
//!
//! `GroupState` is plain data deliberately free of any `async` or locking —
//! it is owned exclusively by the pool actor (see `pool.rs`), which is the
//! single place allowed to mutate it. That ownership discipline is a
//! direct Rust translation of a single-threaded cooperative scheduling
//! model: correctness here falls out of "only one task ever touches this",
//! not from a mutex.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::{Error, Result, SharedError};
use crate::ids::{GroupId, PoolId};

pub const DEFAULT_FREQUENCY_WINDOW: Duration = Duration::from_millis(1000);

/// Where a group stands right now: free to start an operation, saturated by
/// concurrency (no known reopening time), or saturated by frequency (a
/// concrete future instant when the oldest tracked start ages out).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyTime {
    Ready,
    Saturated,
    At(Instant),
}

impl BusyTime {
    pub fn is_ready(self) -> bool {
        matches!(self, BusyTime::Ready)
    }

    /// Earliest of two busy-times, where `Ready` < any `At` < `Saturated`.
    pub fn earliest(self, other: BusyTime) -> BusyTime {
        match (self, other) {
            (BusyTime::Ready, _) | (_, BusyTime::Ready) => BusyTime::Ready,
            (BusyTime::Saturated, x) | (x, BusyTime::Saturated) => x,
            (BusyTime::At(a), BusyTime::At(b)) => BusyTime::At(a.min(b)),
        }
    }
}

/// Options accepted at group construction and by each limit setter.
#[derive(Debug, Clone, Default)]
pub struct GroupOptions {
    pub concurrency_limit: Option<u32>,
    pub frequency_limit: Option<u32>,
    pub frequency_window: Option<Duration>,
}

fn validate_limit(limit: Option<u32>, field: &str) -> Result<Option<u32>> {
    match limit {
        Some(0) => Err(Error::InvalidConfig(format!("{field} must be positive or unset"))),
        other => Ok(other),
    }
}

fn validate_window(window: Option<Duration>) -> Result<Duration> {
    match window {
        None => Ok(DEFAULT_FREQUENCY_WINDOW),
        Some(w) if w.is_zero() => Err(Error::InvalidConfig(
            "frequency_window must be positive".into(),
        )),
        Some(w) => Ok(w),
    }
}

struct StickyRejection {
    error: SharedError,
    /// True within the one-tick grace window after the failure arrived.
    recent: bool,
    /// True once some waiter (completion promise or `wait_for_idle`) has
    /// observed this failure, suppressing duplicate unhandled-rejection noise.
    locally_handled: bool,
    secondary: Vec<SharedError>,
}

/// One limit bucket: concurrency ceiling, frequency ceiling over a sliding
/// window, the tasks/operations currently affiliated, and any sticky
/// rejection.
pub struct GroupState {
    id: GroupId,
    pool_id: PoolId,
    concurrency_limit: Option<u32>,
    frequency_limit: Option<u32>,
    frequency_window: Duration,
    active_task_count: u32,
    active_promise_count: u32,
    frequency_starts: VecDeque<Instant>,
    idle_waiters: Vec<oneshot::Sender<std::result::Result<(), SharedError>>>,
    rejection: Option<StickyRejection>,
}

impl GroupState {
    pub fn new(id: GroupId, pool_id: PoolId, opts: GroupOptions) -> Result<Self> {
        Ok(Self {
            id,
            pool_id,
            concurrency_limit: validate_limit(opts.concurrency_limit, "concurrency_limit")?,
            frequency_limit: validate_limit(opts.frequency_limit, "frequency_limit")?,
            frequency_window: validate_window(opts.frequency_window)?,
            active_task_count: 0,
            active_promise_count: 0,
            frequency_starts: VecDeque::new(),
            idle_waiters: Vec::new(),
            rejection: None,
        })
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn concurrency_limit(&self) -> Option<u32> {
        self.concurrency_limit
    }

    pub fn frequency_limit(&self) -> Option<u32> {
        self.frequency_limit
    }

    pub fn frequency_window(&self) -> Duration {
        self.frequency_window
    }

    pub fn active_task_count(&self) -> u32 {
        self.active_task_count
    }

    pub fn active_promise_count(&self) -> u32 {
        self.active_promise_count
    }

    pub fn set_concurrency_limit(&mut self, limit: Option<u32>) -> Result<()> {
        self.concurrency_limit = validate_limit(limit, "concurrency_limit")?;
        Ok(())
    }

    pub fn set_frequency_limit(&mut self, limit: Option<u32>) -> Result<()> {
        self.frequency_limit = validate_limit(limit, "frequency_limit")?;
        Ok(())
    }

    pub fn set_frequency_window(&mut self, window: Option<Duration>) -> Result<()> {
        self.frequency_window = validate_window(window)?;
        Ok(())
    }

    /// Drop every tracked start that has aged out of the window as of `now`.
    fn trim(&mut self, now: Instant) {
        if self.frequency_limit.is_none() {
            return;
        }
        while let Some(&front) = self.frequency_starts.front() {
            if front + self.frequency_window <= now {
                self.frequency_starts.pop_front();
            } else {
                break;
            }
        }
    }

    /// The busy-time oracle: 0/Ready, +∞/Saturated, or the instant the
    /// oldest tracked start ages out of the window.
    pub fn busy_time(&mut self, now: Instant) -> BusyTime {
        self.trim(now);

        if let Some(limit) = self.concurrency_limit {
            if self.active_promise_count >= limit {
                return BusyTime::Saturated;
            }
        }
        if let Some(limit) = self.frequency_limit {
            if self.frequency_starts.len() as u32 >= limit {
                let oldest = *self.frequency_starts.front().expect("len >= limit > 0");
                return BusyTime::At(oldest + self.frequency_window);
            }
        }
        BusyTime::Ready
    }

    /// `None` means unbounded.
    pub fn free_slots(&mut self, now: Instant) -> Option<u32> {
        self.trim(now);
        let by_concurrency = self
            .concurrency_limit
            .map(|l| l.saturating_sub(self.active_promise_count));
        let by_frequency = self
            .frequency_limit
            .map(|l| l.saturating_sub(self.frequency_starts.len() as u32));
        match (by_concurrency, by_frequency) {
            (None, None) => None,
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (Some(a), Some(b)) => Some(a.min(b)),
        }
    }

    /// Per-operation start bookkeeping: bump the active-operation count and,
    /// if frequency is tracked, record `now` as a new start.
    pub fn record_start(&mut self, now: Instant) {
        self.active_promise_count += 1;
        if self.frequency_limit.is_some() {
            self.frequency_starts.push_back(now);
        }
    }

    /// Per-operation completion bookkeeping.
    pub fn record_operation_complete(&mut self) {
        self.active_promise_count = self.active_promise_count.saturating_sub(1);
    }

    pub fn increment_task_count(&mut self) {
        self.active_task_count += 1;
    }

    /// Decrementing to zero either silently clears a non-recent sticky
    /// rejection or resolves idle waiters.
    pub fn decrement_task_count(&mut self) {
        self.active_task_count = self.active_task_count.saturating_sub(1);
        if self.active_task_count != 0 {
            return;
        }
        let clear_silently = match &self.rejection {
            Some(r) => !r.recent,
            None => false,
        };
        if clear_silently {
            self.rejection = None;
        } else {
            self.resolve_idle_waiters_ok();
        }
    }

    fn resolve_idle_waiters_ok(&mut self) {
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// `true` if the caller should schedule a deferred "next micro-tick"
    /// clear (the one-tick grace window before a fresh rejection becomes
    /// non-recent). `false` means a sticky rejection already existed and
    /// this one was coalesced onto it.
    pub fn reject(&mut self, error: SharedError) -> bool {
        match &mut self.rejection {
            None => {
                let had_waiters = !self.idle_waiters.is_empty();
                for waiter in self.idle_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
                self.rejection = Some(StickyRejection {
                    error,
                    recent: true,
                    locally_handled: had_waiters, // waiters just observed it
                    secondary: Vec::new(),
                });
                true
            }
            Some(existing) => {
                if !existing.locally_handled {
                    existing.secondary.push(error);
                }
                false
            }
        }
    }

    /// Fires once, one micro-tick after `reject` returned `true`.
    pub fn clear_recent_rejection_tick(&mut self) {
        let Some(rejection) = &mut self.rejection else {
            return;
        };
        rejection.recent = false;
        if self.active_task_count < 1 {
            self.rejection = None;
        }
    }

    pub fn wait_for_idle(&mut self, reply: oneshot::Sender<std::result::Result<(), SharedError>>) {
        if let Some(rejection) = &mut self.rejection {
            rejection.locally_handled = true;
            rejection.secondary.clear();
            let _ = reply.send(Err(rejection.error.clone()));
            return;
        }
        if self.active_task_count == 0 {
            let _ = reply.send(Ok(()));
            return;
        }
        self.idle_waiters.push(reply);
    }

    pub fn has_sticky_rejection(&self) -> bool {
        self.rejection.is_some()
    }
}

/// The pool actor's table of every live group, plus the cross-group helpers
/// tasks need (a task is typically affiliated with several groups at once:
/// the pool's global group, its own exclusive group, and zero or more
/// user-supplied groups).
#[derive(Default)]
pub struct GroupTable {
    groups: indexmap::IndexMap<GroupId, GroupState>,
}

impl GroupTable {
    pub fn insert(&mut self, group: GroupState) -> GroupId {
        let id = group.id();
        self.groups.insert(id, group);
        id
    }

    pub fn get(&self, id: GroupId) -> Option<&GroupState> {
        self.groups.get(&id)
    }

    pub fn get_mut(&mut self, id: GroupId) -> Option<&mut GroupState> {
        self.groups.get_mut(&id)
    }

    pub fn remove(&mut self, id: GroupId) -> Option<GroupState> {
        self.groups.shift_remove(&id)
    }

    pub fn active_promise_count(&self, id: GroupId) -> u32 {
        self.groups.get(&id).map(|g| g.active_promise_count()).unwrap_or(0)
    }

    pub fn active_task_count(&self, id: GroupId) -> u32 {
        self.groups.get(&id).map(|g| g.active_task_count()).unwrap_or(0)
    }

    /// The binding busy-time across every affiliated group: the task may
    /// start only once every one of them is ready.
    pub fn busy_time_across(&mut self, ids: &[GroupId], now: Instant) -> BusyTime {
        let mut acc = BusyTime::Ready;
        for &id in ids {
            if let Some(g) = self.groups.get_mut(&id) {
                acc = acc.earliest(g.busy_time(now));
                if matches!(acc, BusyTime::Saturated) {
                    // Saturated can still be overtaken by a later Ready below,
                    // `earliest` already encodes that ordering.
                }
            }
        }
        acc
    }

    pub fn free_slots_across(&mut self, ids: &[GroupId], now: Instant) -> Option<u32> {
        let mut acc: Option<u32> = None;
        for &id in ids {
            if let Some(g) = self.groups.get_mut(&id) {
                acc = match (acc, g.free_slots(now)) {
                    (None, x) => x,
                    (x, None) => x,
                    (Some(a), Some(b)) => Some(a.min(b)),
                };
            }
        }
        acc
    }

    pub fn record_start_all(&mut self, ids: &[GroupId], now: Instant) {
        for &id in ids {
            if let Some(g) = self.groups.get_mut(&id) {
                g.record_start(now);
            }
        }
    }

    pub fn record_complete_all(&mut self, ids: &[GroupId]) {
        for &id in ids {
            if let Some(g) = self.groups.get_mut(&id) {
                g.record_operation_complete();
            }
        }
    }

    pub fn increment_task_count_all(&mut self, ids: &[GroupId]) {
        for &id in ids {
            if let Some(g) = self.groups.get_mut(&id) {
                g.increment_task_count();
            }
        }
    }

    pub fn decrement_task_count_all(&mut self, ids: &[GroupId]) {
        for &id in ids {
            if let Some(g) = self.groups.get_mut(&id) {
                g.decrement_task_count();
            }
        }
    }

    /// Rejects across every affiliated group, returning the ids that need a
    /// deferred "next micro-tick" clear scheduled by the caller (pool actor).
    pub fn reject_all(&mut self, ids: &[GroupId], error: SharedError) -> Vec<GroupId> {
        let mut needs_tick = Vec::new();
        for &id in ids {
            if let Some(g) = self.groups.get_mut(&id) {
                if g.reject(error.clone()) {
                    needs_tick.push(id);
                }
            }
        }
        needs_tick
    }

    pub fn clear_recent_rejection_tick(&mut self, id: GroupId) {
        if let Some(g) = self.groups.get_mut(&id) {
            g.clear_recent_rejection_tick();
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&GroupId, &mut GroupState)> {
        self.groups.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> GroupState {
        GroupState::new(GroupId::next(), PoolId::next(), GroupOptions::default()).unwrap()
    }

    #[test]
    fn unbounded_group_is_always_ready() {
        let mut g = group();
        let now = Instant::now();
        assert_eq!(g.busy_time(now), BusyTime::Ready);
        assert_eq!(g.free_slots(now), None);
    }

    #[test]
    fn concurrency_limit_saturates() {
        let mut g = GroupState::new(
            GroupId::next(),
            PoolId::next(),
            GroupOptions { concurrency_limit: Some(2), ..Default::default() },
        )
        .unwrap();
        let now = Instant::now();
        g.record_start(now);
        g.record_start(now);
        assert_eq!(g.busy_time(now), BusyTime::Saturated);
        assert_eq!(g.free_slots(now), Some(0));
        g.record_operation_complete();
        assert_eq!(g.busy_time(now), BusyTime::Ready);
        assert_eq!(g.free_slots(now), Some(1));
    }

    #[test]
    fn frequency_limit_reports_future_reopen_time() {
        let window = Duration::from_millis(100);
        let mut g = GroupState::new(
            GroupId::next(),
            PoolId::next(),
            GroupOptions {
                frequency_limit: Some(1),
                frequency_window: Some(window),
                ..Default::default()
            },
        )
        .unwrap();
        let now = Instant::now();
        g.record_start(now);
        match g.busy_time(now) {
            BusyTime::At(t) => assert_eq!(t, now + window),
            other => panic!("expected At(_), got {other:?}"),
        }
    }

    #[test]
    fn frequency_starts_trim_after_window_elapses() {
        let window = Duration::from_millis(50);
        let mut g = GroupState::new(
            GroupId::next(),
            PoolId::next(),
            GroupOptions {
                frequency_limit: Some(1),
                frequency_window: Some(window),
                ..Default::default()
            },
        )
        .unwrap();
        let now = Instant::now();
        g.record_start(now);
        assert_eq!(g.busy_time(now + window + Duration::from_millis(1)), BusyTime::Ready);
    }

    #[test]
    fn zero_limit_is_invalid_config() {
        let err = GroupState::new(
            GroupId::next(),
            PoolId::next(),
            GroupOptions { concurrency_limit: Some(0), ..Default::default() },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn decrement_to_zero_with_stale_rejection_clears_silently() {
        let mut g = group();
        g.increment_task_count();
        let err: SharedError = std::sync::Arc::new(Error::GeneratorFailure("boom".into()));
        assert!(g.reject(err));
        g.clear_recent_rejection_tick();
        assert!(g.has_sticky_rejection());
        g.decrement_task_count();
        assert!(!g.has_sticky_rejection());
    }

    #[test]
    fn wait_for_idle_resolves_immediately_when_already_idle() {
        let mut g = group();
        let (tx, rx) = oneshot::channel();
        g.wait_for_idle(tx);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn wait_for_idle_queues_until_idle() {
        let mut g = group();
        g.increment_task_count();
        let (tx, rx) = oneshot::channel();
        g.wait_for_idle(tx);
        assert!(rx.try_recv().is_err());
        g.decrement_task_count();
        assert!(rx.try_recv().unwrap().is_ok());
    }
}
