//! SQLite task store
//!
//! Concrete [`TaskStore`] backed by sqlx. Status writes are idempotent:
//! terminal statuses are sticky at the SQL level, so racing writers (the
//! execution wrapper vs. the timeout watchdog) cannot corrupt a finished
//! task.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::clock::Clock;
use crate::domain::repositories::{StoreError, TaskStore};
use crate::domain::task::{NewTask, Task, TaskId, TaskKind, TaskStatus, new_task_id};

const TERMINAL_STATUSES: &str = "('completed','failed','skipped','cancelled')";

pub struct SqliteTaskStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Create the task table if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crawl_tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                target_site TEXT NOT NULL,
                params TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                status TEXT NOT NULL DEFAULT 'pending',
                progress REAL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_crawl_tasks_status ON crawl_tasks (status, target_site)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Helper method to convert a database row to a Task entity
    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
        let params: String = row.try_get("params")?;
        let kind = TaskKind::from_params(&params)?;

        let status: String = row.try_get("status")?;
        let status: TaskStatus = status.parse().map_err(StoreError::Corrupt)?;

        let created_at: String = row.try_get("created_at")?;
        let created_at = parse_timestamp(&created_at)?;
        let started_at: Option<String> = row.try_get("started_at")?;
        let started_at = started_at.as_deref().map(parse_timestamp).transpose()?;
        let ended_at: Option<String> = row.try_get("ended_at")?;
        let ended_at = ended_at.as_deref().map(parse_timestamp).transpose()?;

        Ok(Task {
            id: row.try_get("id")?,
            kind,
            target_site: row.try_get("target_site")?,
            priority: row.try_get("priority")?,
            status,
            progress: row.try_get("progress")?,
            created_at,
            started_at,
            ended_at,
            error_message: row.try_get("error_message")?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp {raw}: {e}")))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: NewTask) -> Result<Task, StoreError> {
        let id = new_task_id();
        let created_at = self.clock.now();
        let params = task.kind.to_params()?;

        sqlx::query(
            r#"
            INSERT INTO crawl_tasks (id, task_type, target_site, params, priority, status, created_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            "#,
        )
        .bind(&id)
        .bind(task.kind.type_name())
        .bind(&task.target_site)
        .bind(&params)
        .bind(task.priority)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Task {
            id,
            kind: task.kind,
            target_site: task.target_site,
            priority: task.priority,
            status: TaskStatus::Pending,
            progress: None,
            created_at,
            started_at: None,
            ended_at: None,
            error_message: None,
        })
    }

    async fn fetch_pending(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM crawl_tasks WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn fetch_by_id(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM crawl_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now().to_rfc3339();
        if status == TaskStatus::Running {
            let query = format!(
                "UPDATE crawl_tasks
                 SET status = $1, error_message = COALESCE($2, error_message),
                     started_at = COALESCE(started_at, $3)
                 WHERE id = $4 AND status NOT IN {TERMINAL_STATUSES}"
            );
            sqlx::query(&query)
                .bind(status.as_str())
                .bind(error_message)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else if status.is_terminal() {
            let query = format!(
                "UPDATE crawl_tasks
                 SET status = $1, error_message = $2, ended_at = COALESCE(ended_at, $3)
                 WHERE id = $4 AND status NOT IN {TERMINAL_STATUSES}"
            );
            sqlx::query(&query)
                .bind(status.as_str())
                .bind(error_message)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            // Reset to pending: clear the execution timestamps so the task
            // is indistinguishable from a fresh submission.
            let query = format!(
                "UPDATE crawl_tasks
                 SET status = $1, error_message = $2,
                     progress = NULL, started_at = NULL, ended_at = NULL
                 WHERE id = $3 AND status NOT IN {TERMINAL_STATUSES}"
            );
            sqlx::query(&query)
                .bind(status.as_str())
                .bind(error_message)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn update_progress(&self, id: &TaskId, progress: f64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE crawl_tasks SET progress = $1 WHERE id = $2 AND status = 'running'",
        )
        .bind(progress.clamp(0.0, 100.0))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel(&self, id: &TaskId) -> Result<bool, StoreError> {
        let now = self.clock.now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE crawl_tasks SET status = 'cancelled', ended_at = $1
             WHERE id = $2 AND status = 'pending'",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn retry_failed(&self, site: Option<&str>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE crawl_tasks
             SET status = 'pending', error_message = NULL,
                 progress = NULL, started_at = NULL, ended_at = NULL
             WHERE status = 'failed' AND ($1 IS NULL OR target_site = $1)",
        )
        .bind(site)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM crawl_tasks ORDER BY created_at DESC, rowid DESC LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn counts_by_status(
        &self,
        site: &str,
    ) -> Result<HashMap<TaskStatus, u64>, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM crawl_tasks
             WHERE target_site = $1 GROUP BY status",
        )
        .bind(site)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let status: TaskStatus = status.parse().map_err(StoreError::Corrupt)?;
            let count: i64 = row.try_get("count")?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    async fn cleanup_completed(&self, older_than_days: u32) -> Result<u64, StoreError> {
        let cutoff = self.clock.now() - ChronoDuration::days(i64::from(older_than_days));
        let result = sqlx::query(
            "DELETE FROM crawl_tasks
             WHERE status = 'completed' AND ended_at IS NOT NULL AND ended_at < $1",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::constants::sites;
    use crate::test_support::{FakeClock, memory_task_store};
    use chrono::Duration as ChronoDuration;

    fn sales_task(isbn: &str, priority: i32) -> NewTask {
        NewTask::new(
            TaskKind::SalesHistory {
                isbn: isbn.to_string(),
                days_limit: 30,
            },
            sites::KONGFUZI,
            priority,
        )
    }

    #[tokio::test]
    async fn test_create_and_fetch_round_trip() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock.clone()).await;

        let created = store.create(sales_task("111", 5)).await.unwrap();
        let fetched = store.fetch_by_id(&created.id).await.unwrap().unwrap();

        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.priority, 5);
        assert_eq!(fetched.kind, created.kind);
        assert_eq!(fetched.created_at, clock.now());
    }

    #[tokio::test]
    async fn test_pending_order_is_priority_then_insertion() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock).await;

        let a = store.create(sales_task("a", 1)).await.unwrap();
        let b = store.create(sales_task("b", 5)).await.unwrap();
        let c = store.create(sales_task("c", 1)).await.unwrap();

        let pending = store.fetch_pending().await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![b.id.as_str(), a.id.as_str(), c.id.as_str()]);
    }

    #[tokio::test]
    async fn test_update_status_is_idempotent() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock).await;
        let task = store.create(sales_task("x", 5)).await.unwrap();

        store
            .update_status(&task.id, TaskStatus::Completed, None)
            .await
            .unwrap();
        let first = store.fetch_by_id(&task.id).await.unwrap().unwrap();

        store
            .update_status(&task.id, TaskStatus::Completed, None)
            .await
            .unwrap();
        let second = store.fetch_by_id(&task.id).await.unwrap().unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.ended_at, second.ended_at);
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock).await;
        let task = store.create(sales_task("x", 5)).await.unwrap();

        store
            .update_status(&task.id, TaskStatus::Completed, None)
            .await
            .unwrap();
        // A late watchdog write must not clobber the finished task.
        store
            .update_status(&task.id, TaskStatus::Failed, Some("timed out"))
            .await
            .unwrap();

        let stored = store.fetch_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_running_records_started_at_once() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock.clone()).await;
        let task = store.create(sales_task("x", 5)).await.unwrap();

        store
            .update_status(&task.id, TaskStatus::Running, None)
            .await
            .unwrap();
        let started = store
            .fetch_by_id(&task.id)
            .await
            .unwrap()
            .unwrap()
            .started_at
            .unwrap();

        clock.advance(ChronoDuration::seconds(30));
        store
            .update_status(&task.id, TaskStatus::Running, None)
            .await
            .unwrap();
        let stored = store.fetch_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.started_at, Some(started));
    }

    #[tokio::test]
    async fn test_progress_only_recorded_while_running() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock).await;
        let task = store.create(sales_task("x", 5)).await.unwrap();

        // Not running yet: ignored.
        store.update_progress(&task.id, 40.0).await.unwrap();
        let stored = store.fetch_by_id(&task.id).await.unwrap().unwrap();
        assert!(stored.progress.is_none());

        store
            .update_status(&task.id, TaskStatus::Running, None)
            .await
            .unwrap();
        store.update_progress(&task.id, 140.0).await.unwrap();
        let stored = store.fetch_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, Some(100.0));
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock).await;
        let pending = store.create(sales_task("p", 5)).await.unwrap();
        let running = store.create(sales_task("r", 5)).await.unwrap();
        store
            .update_status(&running.id, TaskStatus::Running, None)
            .await
            .unwrap();

        assert!(store.cancel(&pending.id).await.unwrap());
        assert!(!store.cancel(&running.id).await.unwrap());

        let stored = store.fetch_by_id(&pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_failed_scoped_by_site() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock).await;
        let kongfuzi = store.create(sales_task("k", 5)).await.unwrap();
        let duozhuayu = store
            .create(NewTask::new(
                TaskKind::PriceLookup {
                    isbn: "d".to_string(),
                },
                sites::DUOZHUAYU,
                5,
            ))
            .await
            .unwrap();
        for id in [&kongfuzi.id, &duozhuayu.id] {
            store
                .update_status(id, TaskStatus::Failed, Some("boom"))
                .await
                .unwrap();
        }

        let reset = store.retry_failed(Some(sites::KONGFUZI)).await.unwrap();
        assert_eq!(reset, 1);

        let k = store.fetch_by_id(&kongfuzi.id).await.unwrap().unwrap();
        assert_eq!(k.status, TaskStatus::Pending);
        assert!(k.error_message.is_none());
        let d = store.fetch_by_id(&duozhuayu.id).await.unwrap().unwrap();
        assert_eq!(d.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_cleanup_completed_by_age() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock.clone()).await;

        let old = store.create(sales_task("old", 5)).await.unwrap();
        store
            .update_status(&old.id, TaskStatus::Completed, None)
            .await
            .unwrap();

        clock.advance(ChronoDuration::days(10));
        let fresh = store.create(sales_task("fresh", 5)).await.unwrap();
        store
            .update_status(&fresh.id, TaskStatus::Completed, None)
            .await
            .unwrap();

        let deleted = store.cleanup_completed(7).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.fetch_by_id(&old.id).await.unwrap().is_none());
        assert!(store.fetch_by_id(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_counts_by_status() {
        let clock = Arc::new(FakeClock::default());
        let store = memory_task_store(clock).await;

        store.create(sales_task("1", 5)).await.unwrap();
        store.create(sales_task("2", 5)).await.unwrap();
        let failed = store.create(sales_task("3", 5)).await.unwrap();
        store
            .update_status(&failed.id, TaskStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let counts = store.counts_by_status(sites::KONGFUZI).await.unwrap();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&2));
        assert_eq!(counts.get(&TaskStatus::Failed), Some(&1));
    }
}
