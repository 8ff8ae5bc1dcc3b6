use async_trait::async_trait;

use crate::error::StoreError;
use crate::filter::{OrderBy, TaskFilter};
use crate::task::{Task, TaskState, TaskUpdate};

/// The contract both the volatile and durable task stores satisfy (spec
/// section 4.2). `insert` only returns after persistence; `update_state` is
/// a compare-and-swap on `state`; `next_ready` is the atomic READY→ASSIGNED
/// promotion used by the scheduler's dispatch path.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new task in NEW state and assign it a monotonic id.
    async fn insert(&self, args: String, template: String, max_attempts: u32) -> Result<Task, StoreError>;

    async fn get(&self, id: u64) -> Result<Option<Task>, StoreError>;

    /// Compare-and-swap the state field, applying `update` atomically with
    /// the transition. Fails with `StoreError::Conflict` if the current
    /// state isn't `expected_from`.
    async fn update_state(
        &self,
        id: u64,
        expected_from: TaskState,
        to: TaskState,
        update: TaskUpdate,
    ) -> Result<Task, StoreError>;

    /// Atomically transition up to `n` READY tasks (oldest `submit_time`
    /// first, tie-broken by `id`) to ASSIGNED for `host`.
    async fn next_ready(&self, n: usize, host: &str) -> Result<Vec<Task>, StoreError>;

    /// ASSIGNED → READY, incrementing `attempt`. Transitions to ABANDONED
    /// instead if `attempt` would exceed the task's `max_attempts`.
    async fn requeue(&self, id: u64) -> Result<Task, StoreError>;

    /// Mark a task FAILED before it ever runs (template parse error at
    /// submission time, spec section 4.1).
    async fn fail_at_submission(&self, id: u64, reason: String) -> Result<Task, StoreError>;

    async fn query(&self, filter: TaskFilter, order_by: OrderBy, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// All tasks currently in NEW, oldest first — used by the scheduler's
    /// promoter to pick up work a crash left unpromoted (durability
    /// property 1).
    async fn pending_new(&self) -> Result<Vec<Task>, StoreError>;
}
