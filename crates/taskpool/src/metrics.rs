//! Thin `metrics` crate instrumentation: free functions wrapping
//! `counter!`/`gauge!`, called from the scheduler at the points its own
//! core logic already touches. Nothing here changes behavior if no
//! recorder is installed — these are purely additive observability hooks.

use metrics::{counter, gauge};

/// Gauge: number of live tasks currently registered with a pool.
pub fn set_active_tasks(pool_id: u64, count: u32) {
    gauge!("taskpool_active_tasks", "pool" => pool_id.to_string()).set(count as f64);
}

/// Gauge: number of outstanding (in-flight) operations across a pool.
pub fn set_active_operations(pool_id: u64, count: u32) {
    gauge!("taskpool_active_operations", "pool" => pool_id.to_string()).set(count as f64);
}

/// Gauge: queue depth of a persistent batcher's pending inputs.
pub fn set_batcher_queue_depth(count: u32) {
    gauge!("taskpool_batcher_queue_depth").set(count as f64);
}

/// Counter: a task's generator (or its produced operation) failed.
pub fn record_generator_failure() {
    counter!("taskpool_generator_failures_total").increment(1);
}

/// Counter: the scheduler throttled a task producing synchronous operations
/// without yielding.
pub fn record_throttle_event() {
    counter!("taskpool_throttle_events_total").increment(1);
}

/// Counter: a persistent batcher released a batch to its generator.
pub fn record_batch_release() {
    counter!("taskpool_batch_releases_total").increment(1);
}
