use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::StoreError;
use crate::filter::{OrderBy, TaskFilter};
use crate::store_trait::Store;
use crate::task::{Task, TaskState, TaskUpdate};

/// Migration identifier stamped into `schema_meta` on first open (spec
/// section 6: "a migration identifier is stored alongside the schema").
const MIGRATION_ID: &str = "2025-01-hypershell-tasks-v1";

/// Relational task catalog, one row per Task keyed by `id`, indexed on
/// `(state, submit_time)` (spec section 4.2). Backed by a file-local
/// SQLite database by default; operators wanting a networked database
/// point the connection string at one instead, behind this same trait.
pub struct DurableStore {
    pool: SqlitePool,
}

impl DurableStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_meta (migration_id TEXT NOT NULL);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                args TEXT NOT NULL,
                template TEXT NOT NULL,
                submit_time TEXT,
                start_time TEXT,
                complete_time TEXT,
                host TEXT,
                attempt INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                exit_status INTEGER,
                output BLOB,
                error BLOB,
                state TEXT NOT NULL,
                fail_reason TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state_submit ON tasks(state, submit_time);")
            .execute(&self.pool)
            .await?;

        let seeded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_meta")
            .fetch_one(&self.pool)
            .await?;
        if seeded == 0 {
            sqlx::query("INSERT INTO schema_meta (migration_id) VALUES (?)")
                .bind(MIGRATION_ID)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
        let state: String = row.try_get("state")?;
        let state: TaskState = state.parse().map_err(StoreError::Backend)?;
        let uuid: String = row.try_get("uuid")?;
        Ok(Task {
            id: row.try_get::<i64, _>("id")? as u64,
            uuid: Uuid::parse_str(&uuid).map_err(|e| StoreError::Backend(e.to_string()))?,
            args: row.try_get("args")?,
            template: row.try_get("template")?,
            submit_time: row.try_get::<Option<DateTime<Utc>>, _>("submit_time")?,
            start_time: row.try_get::<Option<DateTime<Utc>>, _>("start_time")?,
            complete_time: row.try_get::<Option<DateTime<Utc>>, _>("complete_time")?,
            host: row.try_get("host")?,
            attempt: row.try_get::<i64, _>("attempt")? as u32,
            max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
            exit_status: row.try_get::<Option<i64>, _>("exit_status")?.map(|v| v as i32),
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            state,
            fail_reason: row.try_get("fail_reason")?,
        })
    }

    async fn fetch(&self, id: u64) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        Self::row_to_task(&row)
    }
}

#[async_trait]
impl Store for DurableStore {
    async fn insert(&self, args: String, template: String, max_attempts: u32) -> Result<Task, StoreError> {
        let uuid = Uuid::new_v4();
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tasks (uuid, args, template, submit_time, attempt, max_attempts, state)
            VALUES (?, ?, ?, ?, 1, ?, 'NEW')
            RETURNING id
            "#,
        )
        .bind(uuid.to_string())
        .bind(&args)
        .bind(&template)
        .bind(now)
        .bind(max_attempts as i64)
        .fetch_one(&self.pool)
        .await?;

        self.fetch(id as u64).await
    }

    async fn get(&self, id: u64) -> Result<Option<Task>, StoreError> {
        match self.fetch(id).await {
            Ok(task) => Ok(Some(task)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_state(
        &self,
        id: u64,
        expected_from: TaskState,
        to: TaskState,
        update: TaskUpdate,
    ) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: String = sqlx::query_scalar("SELECT state FROM tasks WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let current: TaskState = current.parse().map_err(StoreError::Backend)?;
        if current != expected_from || current.is_terminal() {
            return Err(StoreError::Conflict {
                id,
                expected: expected_from,
                actual: current,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                state = ?,
                host = COALESCE(?, host),
                start_time = COALESCE(?, start_time),
                complete_time = COALESCE(?, complete_time),
                exit_status = COALESCE(?, exit_status),
                output = COALESCE(?, output),
                error = COALESCE(?, error),
                fail_reason = COALESCE(?, fail_reason),
                attempt = attempt + ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(update.host)
        .bind(update.start_time)
        .bind(update.complete_time)
        .bind(update.exit_status.map(|v| v as i64))
        .bind(update.output)
        .bind(update.error)
        .bind(update.fail_reason)
        .bind(if update.bump_attempt { 1 } else { 0 })
        .bind(id as i64)
        .bind(expected_from.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::Conflict {
                id,
                expected: expected_from,
                actual: current,
            });
        }

        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id as i64)
            .fetch_one(&mut *tx)
            .await?;
        let task = Self::row_to_task(&row)?;
        tx.commit().await?;
        Ok(task)
    }

    async fn next_ready(&self, n: usize, host: &str) -> Result<Vec<Task>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT id FROM tasks WHERE state = 'READY' ORDER BY submit_time ASC, id ASC LIMIT ?",
        )
        .bind(n as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            sqlx::query("UPDATE tasks SET state = 'ASSIGNED', host = ? WHERE id = ? AND state = 'READY'")
                .bind(host)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            out.push(Self::row_to_task(&row)?);
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn requeue(&self, id: u64) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT attempt, max_attempts, state FROM tasks WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let attempt: i64 = row.try_get("attempt")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;
        let state: String = row.try_get("state")?;
        let state: TaskState = state.parse().map_err(StoreError::Backend)?;
        if state != TaskState::Assigned {
            return Err(StoreError::Conflict {
                id,
                expected: TaskState::Assigned,
                actual: state,
            });
        }

        if attempt >= max_attempts {
            sqlx::query("UPDATE tasks SET state = 'ABANDONED' WHERE id = ?")
                .bind(id as i64)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Err(StoreError::AttemptsExhausted(id));
        }

        sqlx::query("UPDATE tasks SET state = 'READY', attempt = attempt + 1 WHERE id = ?")
            .bind(id as i64)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id as i64)
            .fetch_one(&mut *tx)
            .await?;
        let task = Self::row_to_task(&row)?;
        tx.commit().await?;
        Ok(task)
    }

    async fn fail_at_submission(&self, id: u64, reason: String) -> Result<Task, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET state = 'FAILED', fail_reason = ?, complete_time = ? WHERE id = ? AND state NOT IN ('DONE','FAILED','ABANDONED')",
        )
        .bind(&reason)
        .bind(Utc::now())
        .bind(id as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.fetch(id).await?;
            return Err(StoreError::Conflict {
                id,
                expected: TaskState::New,
                actual: current.state,
            });
        }

        self.fetch(id).await
    }

    async fn query(&self, filter: TaskFilter, order_by: OrderBy, limit: usize) -> Result<Vec<Task>, StoreError> {
        let order_sql = match order_by {
            OrderBy::SubmitTimeAsc => "ORDER BY submit_time ASC, id ASC",
            OrderBy::SubmitTimeDesc => "ORDER BY submit_time DESC, id DESC",
            OrderBy::IdAsc => "ORDER BY id ASC",
        };
        let sql = format!("SELECT * FROM tasks {order_sql} LIMIT ?");
        let rows = sqlx::query(&sql).bind(limit as i64).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let task = Self::row_to_task(&row)?;
            if filter.matches(&task) {
                out.push(task);
            }
        }
        Ok(out)
    }

    async fn pending_new(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE state = 'NEW' ORDER BY submit_time ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> DurableStore {
        DurableStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = store().await;
        let task = store.insert("echo hi".into(), "{}".into(), 3).await.unwrap();
        let fetched = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.args, "echo hi");
        assert_eq!(fetched.state, TaskState::New);
    }

    #[tokio::test]
    async fn cas_rejects_wrong_expected_state() {
        let store = store().await;
        let task = store.insert("a".into(), "{}".into(), 1).await.unwrap();
        let err = store
            .update_state(task.id, TaskState::Ready, TaskState::Assigned, TaskUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn next_ready_promotes_fifo() {
        let store = store().await;
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
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, a.id);
    }

    #[tokio::test]
    async fn migration_id_is_stamped_once() {
        let store = store().await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_meta")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
