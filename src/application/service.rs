//! Crawl service facade
//!
//! The surface the business/HTTP layer talks to: submit work, read task and
//! pool status, and drive the manual recovery hooks. Owns the scheduler's
//! lifetime; constructed once at the composition root and handed around by
//! reference (no global singleton).

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::application::pool::{PoolError, PoolStatus, SessionPool};
use crate::application::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, StatsSnapshot};
use crate::domain::clock::Clock;
use crate::domain::collaborators::CrawlerRegistry;
use crate::domain::constants::sites;
use crate::domain::events::PoolEvent;
use crate::domain::repositories::{StoreError, TaskStore};
use crate::domain::session::SessionId;
use crate::domain::task::{NewTask, Task, TaskId, TaskKind, TaskStatus};

/// Combined queue view for the control surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    /// Task counts per status, keyed by site.
    pub per_site: HashMap<String, HashMap<TaskStatus, u64>>,
    /// Most recently created tasks, newest first.
    pub recent: Vec<Task>,
}

/// Facade over the pool, the scheduler and the task store.
pub struct CrawlService {
    pool: SessionPool,
    store: Arc<dyn TaskStore>,
    scheduler: SchedulerHandle,
}

impl CrawlService {
    /// Wire the engine together and start the scheduler loop.
    pub fn start(
        pool: SessionPool,
        store: Arc<dyn TaskStore>,
        crawlers: Arc<CrawlerRegistry>,
        scheduler_config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = Scheduler::new(
            pool.clone(),
            Arc::clone(&store),
            crawlers,
            scheduler_config,
            clock,
        )
        .spawn();
        Self {
            pool,
            store,
            scheduler,
        }
    }

    // ------------------------------------------------------------------
    // Task submission
    // ------------------------------------------------------------------

    pub async fn submit(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let task = self.store.create(task).await?;
        tracing::info!(task_id = %task.id, site = %task.target_site, "task submitted");
        Ok(task.id)
    }

    /// Crawl the sold-listings history for one ISBN.
    pub async fn submit_sales_history(
        &self,
        isbn: &str,
        days_limit: u32,
        priority: i32,
    ) -> Result<TaskId, StoreError> {
        self.submit(NewTask::new(
            TaskKind::SalesHistory {
                isbn: isbn.to_string(),
                days_limit,
            },
            sites::KONGFUZI,
            priority,
        ))
        .await
    }

    /// Crawl a shop's current inventory listing.
    pub async fn submit_shop_listing(
        &self,
        shop_id: &str,
        max_pages: u32,
        priority: i32,
    ) -> Result<TaskId, StoreError> {
        self.submit(NewTask::new(
            TaskKind::ShopListing {
                shop_id: shop_id.to_string(),
                max_pages,
            },
            sites::KONGFUZI,
            priority,
        ))
        .await
    }

    /// Look up the competing marketplace's price for one ISBN.
    pub async fn submit_price_lookup(&self, isbn: &str, priority: i32) -> Result<TaskId, StoreError> {
        self.submit(NewTask::new(
            TaskKind::PriceLookup {
                isbn: isbn.to_string(),
            },
            sites::DUOZHUAYU,
            priority,
        ))
        .await
    }

    // ------------------------------------------------------------------
    // Task inspection and control
    // ------------------------------------------------------------------

    pub async fn status(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.store.fetch_by_id(id).await
    }

    /// Progress report from the site-logic layer for a running task.
    pub async fn report_progress(&self, id: &TaskId, progress: f64) -> Result<(), StoreError> {
        self.store.update_progress(id, progress).await
    }

    /// Cancel a still-pending task. Running tasks can only be ended by the
    /// timeout watchdog.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool, StoreError> {
        let cancelled = self.store.cancel(id).await?;
        if cancelled {
            tracing::info!(task_id = %id, "task cancelled");
        }
        Ok(cancelled)
    }

    /// Re-queue failed tasks, optionally for one site only.
    pub async fn retry_failed(&self, site: Option<&str>) -> Result<u64, StoreError> {
        let reset = self.store.retry_failed(site).await?;
        if reset > 0 {
            tracing::info!(reset, ?site, "failed tasks re-queued");
        }
        Ok(reset)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, StoreError> {
        let mut per_site = HashMap::new();
        for site in [sites::KONGFUZI, sites::DUOZHUAYU] {
            per_site.insert(site.to_string(), self.store.counts_by_status(site).await?);
        }
        Ok(QueueStatus {
            per_site,
            recent: self.store.recent(10).await?,
        })
    }

    /// Delete completed tasks older than the given age.
    pub async fn cleanup_completed(&self, older_than_days: u32) -> Result<u64, StoreError> {
        self.store.cleanup_completed(older_than_days).await
    }

    // ------------------------------------------------------------------
    // Pool control
    // ------------------------------------------------------------------

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub async fn resize_pool(&self, new_size: usize) {
        self.pool.resize(new_size).await;
    }

    /// Manual recovery hook after an operator re-authenticated a session.
    pub fn clear_login_required(&self, session_id: &SessionId, site: &str) -> Result<(), PoolError> {
        self.pool.clear_login_required(session_id, site)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.scheduler.stats()
    }

    /// Stop the scheduler, then tear down the session pool.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.pool.shutdown().await;
    }
}
