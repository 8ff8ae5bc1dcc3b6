use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{info, warn};

use hypershell_store::{Store, Task, TaskState, TaskUpdate};
use hypershell_template::validate;

use crate::error::SchedulerError;
use crate::lease::Lease;

/// Owns the bounded ready-queue and the lease table (spec section 4.3).
/// The task store is the source of truth; the ready-queue is an O(1)
/// dispatch cache over it.
pub struct Scheduler {
    store: Arc<dyn Store>,
    ready_tx: async_channel::Sender<u64>,
    ready_rx: async_channel::Receiver<u64>,
    leases: RwLock<BTreeMap<u64, Lease>>,
    max_attempts: u32,
    lease_ttl: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, maxsize: usize, max_attempts: u32, lease_ttl: Duration) -> Arc<Self> {
        let (ready_tx, ready_rx) = async_channel::bounded(maxsize.max(1));
        Arc::new(Self {
            store,
            ready_tx,
            ready_rx,
            leases: RwLock::new(BTreeMap::new()),
            max_attempts,
            lease_ttl,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Receiver clients pull dispatchable task ids from. Cloning gives a
    /// second handle onto the same bounded MPMC channel, one per dispatch
    /// worker.
    pub fn ready_receiver(&self) -> async_channel::Receiver<u64> {
        self.ready_rx.clone()
    }

    /// Parse, persist, and promote one input line to READY. Blocks (this
    /// is the submitter's backpressure point, spec sections 4.3 and 5) once
    /// the ready-queue is at `maxsize`; does not drop and does not grow the
    /// queue unbounded.
    pub async fn submit_line(&self, args: String, template: String) -> Result<Task, SchedulerError> {
        if let Err(parse_err) = validate(&template) {
            // Persist first so the failure is visible in the store/sinks,
            // matching "the task is marked FAILED... the command is not
            // executed" (spec section 4.1).
            let task = self.store.insert(args, template, self.max_attempts).await?;
            let failed = self
                .store
                .fail_at_submission(task.id, parse_err.to_string())
                .await?;
            return Ok(failed);
        }

        let task = self.store.insert(args, template, self.max_attempts).await?;
        self.promote(task.id).await
    }

    /// NEW → READY, then push onto the bounded ready-queue. The `send`
    /// blocking on a full queue *is* the backpressure mechanism; there is
    /// no separate unbounded staging area.
    pub async fn promote(&self, id: u64) -> Result<Task, SchedulerError> {
        let task = self
            .store
            .update_state(id, TaskState::New, TaskState::Ready, TaskUpdate::default())
            .await?;
        self.ready_tx
            .send(id)
            .await
            .map_err(|_| SchedulerError::QueueClosed)?;
        Ok(task)
    }

    /// Re-drive any NEW task a crash left unpromoted. Called once at
    /// startup against a durable store (testable property 1: durability).
    pub async fn recover_pending(&self) -> Result<usize, SchedulerError> {
        let pending = self.store.pending_new().await?;
        let count = pending.len();
        for task in pending {
            self.promote(task.id).await?;
        }
        Ok(count)
    }

    /// Lease a dispatchable task id to `client_id`, transitioning it to
    /// ASSIGNED in the store. The ready-channel token is consumed purely as
    /// a "some task is ready" signal; the task actually handed out is
    /// whichever one the store's own FIFO pick promotes, so there is never
    /// a second, independent selection that can disagree with the store
    /// (see `store.next_ready`'s atomicity guarantee).
    pub async fn lease_next(&self, client_id: &str, host: &str) -> Result<Option<(Task, Lease)>, SchedulerError> {
        if self.ready_rx.try_recv().is_err() {
            return Ok(None);
        }
        let mut batch = self.store.next_ready(1, host).await?;
        let Some(task) = batch.pop() else {
            return Ok(None);
        };
        let now = Utc::now();
        let lease = Lease {
            task_id: task.id,
            client_id: client_id.to_string(),
            granted_at: now,
            deadline: now + self.lease_ttl,
        };
        self.leases.write().await.insert(task.id, lease.clone());
        Ok(Some((task, lease)))
    }

    pub async fn release_lease(&self, task_id: u64) {
        self.leases.write().await.remove(&task_id);
    }

    /// All leases held by a disconnected client are revoked immediately,
    /// without waiting for expiry (spec section 4.3). Leases are walked in
    /// task-id order (a `BTreeMap`, matching `submit_time` order since ids
    /// are monotonic) so a client holding several leases requeues them in
    /// the same FIFO order they were originally submitted in.
    pub async fn revoke_client_leases(&self, client_id: &str) -> Result<(), SchedulerError> {
        let expired: Vec<u64> = {
            let leases = self.leases.read().await;
            leases
                .iter()
                .filter(|(_, l)| l.client_id == client_id)
                .map(|(task_id, _)| *task_id)
                .collect()
        };
        for task_id in expired {
            self.requeue_or_abandon(task_id).await?;
        }
        Ok(())
    }

    async fn requeue_or_abandon(&self, task_id: u64) -> Result<(), SchedulerError> {
        self.leases.write().await.remove(&task_id);
        match self.store.requeue(task_id).await {
            Ok(_) => {
                self.ready_tx
                    .send(task_id)
                    .await
                    .map_err(|_| SchedulerError::QueueClosed)?;
            }
            Err(hypershell_store::StoreError::AttemptsExhausted(id)) => {
                warn!(task_id = id, "task abandoned after exhausting attempts");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Background promoter: periodically re-drives any NEW task found in
    /// the store, not just at startup. This is what lets a separate
    /// `submit` process, writing directly into a shared durable store,
    /// have its tasks picked up by a running server (spec section 5: "1
    /// scheduler promoter (wakes on store or ready-queue change)").
    pub async fn run_promoter(self: Arc<Self>) {
        let mut ticker = interval(StdDuration::from_millis(200));
        loop {
            ticker.tick().await;
            match self.recover_pending().await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "promoter picked up externally submitted tasks"),
                Err(e) => warn!(error = %e, "promoter failed to scan for pending tasks"),
            }
        }
    }

    /// Background reaper: wakes every second, finds expired leases, and
    /// requeues each (spec section 4.3).
    pub async fn run_reaper(self: Arc<Self>) {
        let mut ticker = interval(StdDuration::from_secs(1));
        loop {
            ticker.tick().await;
            let now: DateTime<Utc> = Utc::now();
            let expired: Vec<u64> = {
                let leases = self.leases.read().await;
                leases
                    .values()
                    .filter(|l| l.is_expired(now))
                    .map(|l| l.task_id)
                    .collect()
            };
            for task_id in expired {
                info!(task_id, "lease expired, requeueing");
                if let Err(e) = self.requeue_or_abandon(task_id).await {
                    warn!(task_id, error = %e, "failed to requeue expired lease");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypershell_store::VolatileStore;

    fn scheduler(maxsize: usize, max_attempts: u32) -> Arc<Scheduler> {
        Scheduler::new(Arc::new(VolatileStore::new()), maxsize, max_attempts, Duration::seconds(300))
    }

    #[tokio::test]
    async fn submit_line_promotes_to_ready_queue() {
        let sched = scheduler(10, 1);
        let task = sched.submit_line("0".into(), "echo {}".into()).await.unwrap();
        assert_eq!(task.state, TaskState::Ready);
    }

    #[tokio::test]
    async fn bad_template_fails_at_submission_without_executing() {
        let sched = scheduler(10, 1);
        let task = sched.submit_line("0".into(), "{[1:3}".into()).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.fail_reason.is_some());
    }

    #[tokio::test]
    async fn lease_next_assigns_and_revoke_requeues() {
        let sched = scheduler(10, 2);
        sched.submit_line("0".into(), "{}".into()).await.unwrap();
        let (task, lease) = sched.lease_next("client-1", "host-a").await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Assigned);
        assert_eq!(lease.client_id, "client-1");

        sched.revoke_client_leases("client-1").await.unwrap();
        let refreshed = sched.store().get(task.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, TaskState::Ready);
        assert_eq!(refreshed.attempt, 2);
    }

    #[tokio::test]
    async fn backpressure_blocks_when_ready_queue_is_full() {
        let sched = scheduler(1, 1);
        sched.submit_line("0".into(), "{}".into()).await.unwrap();

        let sched2 = sched.clone();
        let blocked = tokio::spawn(async move { sched2.submit_line("1".into(), "{}".into()).await });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Draining one slot unblocks the pending submit.
        let _ = sched.lease_next("client-1", "host-a").await.unwrap();
        let result = blocked.await.unwrap();
        assert!(result.is_ok());
    }
}
