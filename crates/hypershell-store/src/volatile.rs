use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::StoreError;
use crate::filter::{OrderBy, TaskFilter};
use crate::store_trait::Store;
use crate::task::{Task, TaskState, TaskUpdate};

/// In-memory ordered task catalog. Only the currently live generation is
/// retained; a process restart loses everything (spec section 4.2).
pub struct VolatileStore {
    tasks: Arc<RwLock<BTreeMap<u64, Task>>>,
    next_id: AtomicU64,
}

impl Default for VolatileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VolatileStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Store for VolatileStore {
    async fn insert(&self, args: String, template: String, max_attempts: u32) -> Result<Task, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut task = Task::new(id, args, template, max_attempts);
        task.submit_time = Some(Utc::now());
        self.tasks.write().await.insert(id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: u64) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update_state(
        &self,
        id: u64,
        expected_from: TaskState,
        to: TaskState,
        update: TaskUpdate,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.state != expected_from {
            return Err(StoreError::Conflict {
                id,
                expected: expected_from,
                actual: task.state,
            });
        }
        if task.state.is_terminal() {
            return Err(StoreError::Conflict {
                id,
                expected: expected_from,
                actual: task.state,
            });
        }

        task.state = to;
        if let Some(host) = update.host {
            task.host = Some(host);
        }
        if let Some(t) = update.start_time {
            task.start_time = Some(t);
        }
        if let Some(t) = update.complete_time {
            task.complete_time = Some(t);
        }
        if update.exit_status.is_some() {
            task.exit_status = update.exit_status;
        }
        if update.output.is_some() {
            task.output = update.output;
        }
        if update.error.is_some() {
            task.error = update.error;
        }
        if update.fail_reason.is_some() {
            task.fail_reason = update.fail_reason;
        }
        if update.bump_attempt {
            task.attempt += 1;
        }
        Ok(task.clone())
    }

    async fn next_ready(&self, n: usize, host: &str) -> Result<Vec<Task>, StoreError> {
        let mut tasks = self.tasks.write().await;
        let mut candidates: Vec<u64> = tasks
            .values()
            .filter(|t| t.state == TaskState::Ready)
            .map(|t| t.id)
            .collect();
        candidates.sort_by_key(|id| {
            let t = &tasks[id];
            (t.submit_time, *id)
        });
        candidates.truncate(n);

        let mut out = Vec::with_capacity(candidates.len());
        for id in candidates {
            let task = tasks.get_mut(&id).expect("candidate id must exist");
            task.state = TaskState::Assigned;
            task.host = Some(host.to_string());
            out.push(task.clone());
        }
        Ok(out)
    }

    async fn requeue(&self, id: u64) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.state != TaskState::Assigned {
            return Err(StoreError::Conflict {
                id,
                expected: TaskState::Assigned,
                actual: task.state,
            });
        }
        if task.attempt >= task.max_attempts {
            task.state = TaskState::Abandoned;
            warn!(task_id = id, attempt = task.attempt, "attempts exhausted, abandoning task");
            return Err(StoreError::AttemptsExhausted(id));
        }
        task.attempt += 1;
        task.state = TaskState::Ready;
        Ok(task.clone())
    }

    async fn fail_at_submission(&self, id: u64, reason: String) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.state.is_terminal() {
            return Err(StoreError::Conflict {
                id,
                expected: TaskState::New,
                actual: task.state,
            });
        }
        task.state = TaskState::Failed;
        task.fail_reason = Some(reason);
        task.complete_time = Some(Utc::now());
        Ok(task.clone())
    }

    async fn query(&self, filter: TaskFilter, order_by: OrderBy, limit: usize) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        match order_by {
            OrderBy::SubmitTimeAsc => out.sort_by_key(|t| (t.submit_time, t.id)),
            OrderBy::SubmitTimeDesc => {
                out.sort_by_key(|t| (t.submit_time, t.id));
                out.reverse();
            }
            OrderBy::IdAsc => out.sort_by_key(|t| t.id),
        }
        out.truncate(limit);
        Ok(out)
    }

    async fn pending_new(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| t.state == TaskState::New)
            .cloned()
            .collect();
        out.sort_by_key(|t| (t.submit_time, t.id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_assigns_monotonic_ids() {
        let store = VolatileStore::new();
        let a = store.insert("echo a".into(), "{}".into(), 1).await.unwrap();
        let b = store.insert("echo b".into(), "{}".into(), 1).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn next_ready_is_fifo_by_submit_time() {
        let store = VolatileStore::new();
        let a = store.insert("a".into(), "{}".into(), 1).await.unwrap();
        let b = store.insert("b".into(), "{}".into(), 1).await.unwrap();
        store
            .update_state(a.id, TaskState::New, TaskState::Ready, TaskUpdate::default())
            .await
            .unwrap();
        store
            .update_state(b.id, TaskState::New, TaskState::Ready, TaskUpdate::default())
            .await
            .unwrap();

        let batch = store.next_ready(10, "worker-1").await.unwrap();
        assert_eq!(batch[0].id, a.id);
        assert_eq!(batch[1].id, b.id);
        assert_eq!(batch[0].state, TaskState::Assigned);
        assert_eq!(batch[0].host.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn update_state_rejects_wrong_expected_state() {
        let store = VolatileStore::new();
        let t = store.insert("a".into(), "{}".into(), 1).await.unwrap();
        let err = store
            .update_state(t.id, TaskState::Ready, TaskState::Assigned, TaskUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn requeue_abandons_once_attempts_exhausted() {
        let store = VolatileStore::new();
        let t = store.insert("a".into(), "{}".into(), 1).await.unwrap();
        store
            .update_state(t.id, TaskState::New, TaskState::Ready, TaskUpdate::default())
            .await
            .unwrap();
        store.next_ready(1, "worker-1").await.unwrap();

        let err = store.requeue(t.id).await.unwrap_err();
        assert!(matches!(err, StoreError::AttemptsExhausted(_)));
        let task = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Abandoned);
    }

    #[tokio::test]
    async fn requeue_increments_attempt_when_budget_remains() {
        let store = VolatileStore::new();
        let t = store.insert("a".into(), "{}".into(), 3).await.unwrap();
        store
            .update_state(t.id, TaskState::New, TaskState::Ready, TaskUpdate::default())
            .await
            .unwrap();
        store.next_ready(1, "worker-1").await.unwrap();

        let requeued = store.requeue(t.id).await.unwrap();
        assert_eq!(requeued.state, TaskState::Ready);
        assert_eq!(requeued.attempt, 2);
    }

    #[tokio::test]
    async fn terminal_states_are_immutable() {
        let store = VolatileStore::new();
        let t = store.insert("a".into(), "{}".into(), 1).await.unwrap();
        store.fail_at_submission(t.id, "bad template".into()).await.unwrap();
        let err = store
            .update_state(t.id, TaskState::Failed, TaskState::Ready, TaskUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }
}
