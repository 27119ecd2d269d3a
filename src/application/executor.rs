//! Execution wrapper
//!
//! Runs one task's site-specific body against a leased session, classifies
//! the outcome, and feeds it back into the availability tracker, the rate
//! governor and the task store. The lease is dropped on every exit path,
//! including panics, so a session can never leak as permanently busy.
//!
//! Collaborator errors never propagate out of this boundary; they become
//! task status plus tracker state.

use std::sync::Arc;

use crate::application::pool::{SessionLease, SessionPool};
use crate::application::scheduler::EngineStats;
use crate::domain::collaborators::{CrawlError, CrawlerRegistry};
use crate::domain::repositories::TaskStore;
use crate::domain::task::{Task, TaskId, TaskStatus};

pub struct ExecutionWrapper {
    pool: SessionPool,
    store: Arc<dyn TaskStore>,
    crawlers: Arc<CrawlerRegistry>,
    stats: Arc<EngineStats>,
}

impl ExecutionWrapper {
    pub fn new(
        pool: SessionPool,
        store: Arc<dyn TaskStore>,
        crawlers: Arc<CrawlerRegistry>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            pool,
            store,
            crawlers,
            stats,
        }
    }

    /// Execute one dispatched task. The task is already `running` in the
    /// store; this call finishes it.
    pub async fn execute(&self, task: Task, lease: SessionLease) {
        let site = task.target_site.clone();
        let session_id = lease.session_id().clone();

        let outcome = match self.crawlers.get(&site) {
            Some(crawler) => crawler.execute(lease.session(), &task.kind).await,
            None => Err(CrawlError::Failed(format!(
                "no crawler registered for site {site}"
            ))),
        };

        match outcome {
            Ok(result) => {
                self.pool.record_success(&session_id, &site);
                self.stats.record_completed();
                tracing::info!(task_id = %task.id, site, "task completed");
                tracing::debug!(task_id = %task.id, %result, "task result");
                self.finish(&task.id, TaskStatus::Completed, None).await;
            }
            Err(CrawlError::RateLimited(message)) => {
                let blocked_until = self.pool.record_rate_limited(&session_id, &site, &message);
                self.stats.record_failed();
                tracing::warn!(
                    task_id = %task.id,
                    site,
                    ?blocked_until,
                    "task failed: rate limited"
                );
                self.finish(&task.id, TaskStatus::Failed, Some(&message)).await;
            }
            Err(CrawlError::LoginRequired(message)) => {
                let all_blocked = self.pool.record_login_required(&session_id, &site, &message);
                self.stats.record_failed();
                if all_blocked {
                    tracing::error!(site, "no sessions available for site: all require login");
                }
                self.finish(&task.id, TaskStatus::Failed, Some(&message)).await;
            }
            Err(CrawlError::Failed(message)) => {
                self.pool.record_error(&session_id, &site, &message);
                self.stats.record_failed();
                tracing::warn!(task_id = %task.id, site, error = %message, "task failed");
                self.finish(&task.id, TaskStatus::Failed, Some(&message)).await;
            }
        }
        // Lease dropped here: the session returns to the pool regardless of
        // which branch ran.
    }

    async fn finish(&self, id: &TaskId, status: TaskStatus, error_message: Option<&str>) {
        if let Err(error) = self.store.update_status(id, status, error_message).await {
            tracing::warn!(task_id = %id, %error, "failed to persist task status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::pool::PoolConfig;
    use crate::application::rate_governor::RateConfig;
    use crate::domain::clock::Clock;
    use crate::domain::constants::sites;
    use crate::domain::site_state::SiteStatus;
    use crate::domain::task::{NewTask, TaskKind};
    use crate::test_support::{FakeClock, MockDriver, ScriptedCrawler, memory_task_store};
    use std::time::Duration;

    async fn harness(
        script: Vec<Result<serde_json::Value, CrawlError>>,
    ) -> (ExecutionWrapper, SessionPool, Arc<dyn TaskStore>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::default());
        let driver = Arc::new(MockDriver::new());
        let pool = SessionPool::new(
            driver,
            clock.clone(),
            PoolConfig::default(),
            RateConfig::default(),
        );
        let store: Arc<dyn TaskStore> = Arc::new(memory_task_store(clock.clone()).await);
        let mut registry = CrawlerRegistry::new();
        registry.register(sites::KONGFUZI, Arc::new(ScriptedCrawler::with_script(script)));
        let wrapper = ExecutionWrapper::new(
            pool.clone(),
            Arc::clone(&store),
            Arc::new(registry),
            Arc::new(EngineStats::default()),
        );
        (wrapper, pool, store, clock)
    }

    async fn submitted_task(store: &Arc<dyn TaskStore>) -> Task {
        store
            .create(NewTask::new(
                TaskKind::PriceLookup {
                    isbn: "9787020002207".to_string(),
                },
                sites::KONGFUZI,
                5,
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_task_and_resets_tracker() {
        let (wrapper, pool, store, _clock) =
            harness(vec![Ok(serde_json::json!({"records": 3}))]).await;
        let task = submitted_task(&store).await;
        let lease = pool
            .acquire_for_site(sites::KONGFUZI, Duration::from_secs(1))
            .await
            .unwrap();

        wrapper.execute(task.clone(), lease).await;

        let stored = store.fetch_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        let status = pool.status();
        assert_eq!(status.size_busy, 0);
        assert_eq!(
            status.sessions[0].sites[sites::KONGFUZI].status,
            SiteStatus::Available
        );
    }

    #[tokio::test]
    async fn test_rate_limited_outcome_penalizes_and_fails_task() {
        let (wrapper, pool, store, clock) = harness(vec![Err(CrawlError::RateLimited(
            "RATE_LIMITED: slow down".to_string(),
        ))])
        .await;
        let task = submitted_task(&store).await;
        let lease = pool
            .acquire_for_site(sites::KONGFUZI, Duration::from_secs(1))
            .await
            .unwrap();

        wrapper.execute(task.clone(), lease).await;

        let stored = store.fetch_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error_message.unwrap().contains("RATE_LIMITED"));

        // Session released but ineligible for the site until the penalty
        // expires.
        let status = pool.status();
        assert_eq!(status.size_busy, 0);
        assert!(pool.try_acquire_for_site(sites::KONGFUZI).await.is_none());
        let unblock = status.sites[sites::KONGFUZI].earliest_unblock_at.unwrap();
        assert!(unblock > clock.now());
    }

    #[tokio::test]
    async fn test_generic_error_marks_site_soft_errored() {
        let (wrapper, pool, store, _clock) = harness(vec![Err(CrawlError::Failed(
            "selector drifted".to_string(),
        ))])
        .await;
        let task = submitted_task(&store).await;
        let lease = pool
            .acquire_for_site(sites::KONGFUZI, Duration::from_secs(1))
            .await
            .unwrap();

        wrapper.execute(task.clone(), lease).await;

        let stored = store.fetch_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        // Soft error: the session may be dispatched again immediately.
        assert!(pool.try_acquire_for_site(sites::KONGFUZI).await.is_some());
    }

    #[tokio::test]
    async fn test_missing_crawler_fails_task_without_blocking_site() {
        let (wrapper, pool, store, _clock) = harness(vec![]).await;
        let task = store
            .create(NewTask::new(
                TaskKind::PriceLookup {
                    isbn: "x".to_string(),
                },
                "unknown-site",
                5,
            ))
            .await
            .unwrap();
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();

        wrapper.execute(task.clone(), lease).await;

        let stored = store.fetch_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error_message.unwrap().contains("no crawler registered"));
        assert_eq!(pool.status().size_busy, 0);
    }
}
