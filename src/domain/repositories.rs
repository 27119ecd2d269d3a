//! Task store contract
//!
//! The task store is the durable record of submitted work. The engine treats
//! it as externally transactional: it only issues idempotent status updates
//! (writing the same terminal status twice is a no-op, not an error).

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::task::{NewTask, Task, TaskId, TaskStatus};

/// Errors from the task store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored task: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable store of crawl tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task as `pending` and return it with id and timestamps.
    async fn create(&self, task: NewTask) -> Result<Task, StoreError>;

    /// All `pending` tasks, ordered highest priority first, then insertion
    /// order as the tie-break.
    async fn fetch_pending(&self) -> Result<Vec<Task>, StoreError>;

    async fn fetch_by_id(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Transition a task's status. Terminal statuses are sticky: once a task
    /// is completed/failed/skipped/cancelled, further updates are silently
    /// ignored, which makes the call idempotent and protects against the
    /// watchdog racing a just-finished job.
    async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Record the completion percentage of a running task. Ignored for tasks
    /// in any other state.
    async fn update_progress(&self, id: &TaskId, progress: f64) -> Result<(), StoreError>;

    /// Cancel a task if (and only if) it is still `pending`. Returns whether
    /// a row changed.
    async fn cancel(&self, id: &TaskId) -> Result<bool, StoreError>;

    /// Flip `failed` tasks (optionally scoped to one site) back to `pending`
    /// so the scheduler picks them up again. Returns the number reset.
    async fn retry_failed(&self, site: Option<&str>) -> Result<u64, StoreError>;

    /// Most recently created tasks, newest first.
    async fn recent(&self, limit: u32) -> Result<Vec<Task>, StoreError>;

    /// Task counts per status for one site.
    async fn counts_by_status(&self, site: &str)
    -> Result<HashMap<TaskStatus, u64>, StoreError>;

    /// Delete completed tasks older than the given age. Returns the number
    /// deleted.
    async fn cleanup_completed(&self, older_than_days: u32) -> Result<u64, StoreError>;
}
