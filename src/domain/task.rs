//! Crawl task entity and lifecycle
//!
//! A task is one unit of scheduled work targeting one site. The typed
//! [`TaskKind`] payload is what the site crawlers consume; the task store
//! persists it as an opaque JSON blob so the schema stays stable while task
//! types evolve.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable task identity (uuid v4, stored as TEXT).
pub type TaskId = String;

/// Allocate a fresh task id.
pub fn new_task_id() -> TaskId {
    Uuid::new_v4().to_string()
}

/// Persisted task lifecycle status.
///
/// `pending` tasks may be cancelled; once `running`, only the execution
/// wrapper (to `completed`/`failed`) or the timeout watchdog (to `failed`)
/// may transition them. `skipped` is reserved for the business layer marking
/// work it chose not to schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are sticky: once written they are never overwritten,
    /// which makes repeated status updates idempotent.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

/// Typed task payload, one variant per supported crawl operation.
///
/// Serialized with an internal `type` tag so the stored JSON blob is
/// self-describing and round-trips without consulting the separate
/// `task_type` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Walk the sold-listings search for one ISBN and collect sales records.
    SalesHistory { isbn: String, days_limit: u32 },

    /// Walk a shop's listing pages and collect its current inventory.
    ShopListing { shop_id: String, max_pages: u32 },

    /// Look up the competing marketplace's buy/sell price for one ISBN.
    PriceLookup { isbn: String },
}

impl TaskKind {
    /// Discriminant string stored in the `task_type` column.
    pub fn type_name(&self) -> &'static str {
        match self {
            TaskKind::SalesHistory { .. } => "sales_history",
            TaskKind::ShopListing { .. } => "shop_listing",
            TaskKind::PriceLookup { .. } => "price_lookup",
        }
    }

    /// Serialize to the opaque storage form.
    pub fn to_params(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Rehydrate from the opaque storage form.
    pub fn from_params(params: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(params)
    }
}

/// A unit of scheduled work as read from / written to the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub target_site: String,
    pub priority: i32,
    pub status: TaskStatus,
    /// Completion percentage (0-100) reported by the running crawl, if any.
    pub progress: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Submission form of a task, before the store assigns id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub kind: TaskKind,
    pub target_site: String,
    pub priority: i32,
}

impl NewTask {
    pub fn new(kind: TaskKind, target_site: impl Into<String>, priority: i32) -> Self {
        Self {
            kind,
            target_site: target_site.into(),
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Skipped,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<TaskStatus>().is_err());
    }

    #[rstest::rstest]
    #[case(TaskStatus::Pending, false)]
    #[case(TaskStatus::Running, false)]
    #[case(TaskStatus::Completed, true)]
    #[case(TaskStatus::Failed, true)]
    #[case(TaskStatus::Skipped, true)]
    #[case(TaskStatus::Cancelled, true)]
    fn test_terminal_statuses(#[case] status: TaskStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn test_kind_params_round_trip() {
        let kind = TaskKind::SalesHistory {
            isbn: "9787020002207".to_string(),
            days_limit: 30,
        };
        let params = kind.to_params().unwrap();
        assert_eq!(TaskKind::from_params(&params).unwrap(), kind);
        assert_eq!(kind.type_name(), "sales_history");
    }

    #[test]
    fn test_kind_params_is_tagged_json() {
        let kind = TaskKind::PriceLookup {
            isbn: "9780132350884".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&kind.to_params().unwrap()).unwrap();
        assert_eq!(value["type"], "price_lookup");
        assert_eq!(value["isbn"], "9780132350884");
    }
}
