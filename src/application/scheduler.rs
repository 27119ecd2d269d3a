//! Scheduler loop
//!
//! One logical loop drives the engine: pull pending tasks from the store,
//! match them to eligible sessions, dispatch asynchronously, and watchdog
//! the in-flight set against the per-task timeout.
//!
//! Ordering: highest priority first, then insertion order. Head-of-line
//! blocking is scoped per target site: a site with no eligible session
//! defers its own tasks but never holds back tasks for other sites. There is
//! no global ordering guarantee across sites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::executor::ExecutionWrapper;
use crate::application::pool::SessionPool;
use crate::domain::clock::Clock;
use crate::domain::collaborators::CrawlerRegistry;
use crate::domain::repositories::{StoreError, TaskStore};
use crate::domain::task::{TaskId, TaskStatus};

/// Scheduler tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Idle sleep between loop passes, in milliseconds.
    pub tick_ms: u64,

    /// Per-task execution timeout enforced by the watchdog, in seconds.
    pub task_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            task_timeout_secs: 5 * 60,
        }
    }
}

/// Engine-wide counters, shared between the loop and the execution wrapper.
#[derive(Debug, Default)]
pub struct EngineStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl EngineStats {
    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Some(now);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            last_activity: self.last_activity.lock().ok().and_then(|last| *last),
        }
    }
}

/// Serializable counter snapshot for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

struct Inflight {
    site: String,
    started: tokio::time::Instant,
    handle: JoinHandle<()>,
}

/// The scheduling loop. Construct, then [`Scheduler::spawn`].
pub struct Scheduler {
    pool: SessionPool,
    store: Arc<dyn TaskStore>,
    executor: Arc<ExecutionWrapper>,
    config: SchedulerConfig,
    stats: Arc<EngineStats>,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
    inflight: HashMap<TaskId, Inflight>,
}

impl Scheduler {
    pub fn new(
        pool: SessionPool,
        store: Arc<dyn TaskStore>,
        crawlers: Arc<CrawlerRegistry>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stats = Arc::new(EngineStats::default());
        let executor = Arc::new(ExecutionWrapper::new(
            pool.clone(),
            Arc::clone(&store),
            crawlers,
            Arc::clone(&stats),
        ));
        Self {
            pool,
            store,
            executor,
            config,
            stats,
            cancel: CancellationToken::new(),
            clock,
            inflight: HashMap::new(),
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Run the loop on its own tokio task and return a control handle.
    pub fn spawn(self) -> SchedulerHandle {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(self.run());
        SchedulerHandle {
            cancel,
            stats,
            join,
        }
    }

    async fn run(mut self) {
        tracing::info!("scheduler loop started");
        let tick = Duration::from_millis(self.config.tick_ms.max(10));
        loop {
            self.tick().await;
            self.pool.sweep().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }
        }

        // Shutdown: abandon in-flight jobs and record why. Terminal-sticky
        // status updates make this safe against jobs that just finished.
        for (task_id, inflight) in self.inflight.drain() {
            inflight.handle.abort();
            let _ = inflight.handle.await;
            if let Err(error) = self
                .store
                .update_status(
                    &task_id,
                    TaskStatus::Failed,
                    Some("scheduler shut down before task finished"),
                )
                .await
            {
                tracing::warn!(task_id = %task_id, %error, "failed to persist shutdown status");
            }
        }
        tracing::info!("scheduler loop stopped");
    }

    async fn tick(&mut self) {
        self.reap_finished().await;
        self.enforce_timeouts().await;
        if let Err(error) = self.dispatch_pending().await {
            tracing::warn!(%error, "dispatch pass failed");
        }
        self.stats.touch(self.clock.now());
    }

    /// Drop completed jobs from the in-flight set; surface panics as task
    /// failures (the lease was already released during unwind).
    async fn reap_finished(&mut self) {
        let finished: Vec<TaskId> = self
            .inflight
            .iter()
            .filter(|(_, inflight)| inflight.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in finished {
            let Some(inflight) = self.inflight.remove(&task_id) else {
                continue;
            };
            if let Err(join_error) = inflight.handle.await {
                if join_error.is_panic() {
                    tracing::error!(task_id = %task_id, "task job panicked");
                    self.stats.record_failed();
                    if let Err(error) = self
                        .store
                        .update_status(&task_id, TaskStatus::Failed, Some("task job panicked"))
                        .await
                    {
                        tracing::warn!(task_id = %task_id, %error, "failed to persist panic status");
                    }
                }
            }
        }
    }

    /// Force-fail jobs that exceeded the per-task timeout. Aborting the job
    /// drops its lease, which returns the session to the pool; the underlying
    /// browser call is abandoned.
    async fn enforce_timeouts(&mut self) {
        let timeout = Duration::from_secs(self.config.task_timeout_secs.max(1));
        let expired: Vec<TaskId> = self
            .inflight
            .iter()
            .filter(|(_, inflight)| inflight.started.elapsed() >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in expired {
            let Some(inflight) = self.inflight.remove(&task_id) else {
                continue;
            };
            tracing::warn!(
                task_id = %task_id,
                site = %inflight.site,
                "task exceeded timeout, force-failing"
            );
            inflight.handle.abort();
            // Await the aborted job so the session release has happened
            // before this watchdog pass reports the slot free.
            let _ = inflight.handle.await;
            let message = format!(
                "task timed out after {}s",
                self.config.task_timeout_secs.max(1)
            );
            if let Err(error) = self
                .store
                .update_status(&task_id, TaskStatus::Failed, Some(&message))
                .await
            {
                tracing::warn!(task_id = %task_id, %error, "failed to persist timeout status");
            }
            self.stats.record_timed_out();
        }
    }

    /// Match pending tasks to eligible sessions, highest priority first.
    async fn dispatch_pending(&mut self) -> Result<(), StoreError> {
        let pending = self.store.fetch_pending().await?;
        let mut blocked_sites: HashSet<String> = HashSet::new();
        for task in pending {
            if self.inflight.contains_key(&task.id) {
                continue;
            }
            // A site that could not dispatch keeps its queue order; tasks
            // for other sites continue unaffected.
            if blocked_sites.contains(&task.target_site) {
                continue;
            }
            match self.pool.try_acquire_for_site(&task.target_site).await {
                Some(lease) => {
                    if let Err(error) = self
                        .store
                        .update_status(&task.id, TaskStatus::Running, None)
                        .await
                    {
                        tracing::warn!(
                            task_id = %task.id,
                            %error,
                            "failed to mark task running, returning session"
                        );
                        drop(lease);
                        continue;
                    }
                    tracing::debug!(
                        task_id = %task.id,
                        session_id = %lease.session_id(),
                        site = %task.target_site,
                        "dispatching task"
                    );
                    let executor = Arc::clone(&self.executor);
                    let task_id = task.id.clone();
                    let site = task.target_site.clone();
                    let handle = tokio::spawn(async move { executor.execute(task, lease).await });
                    self.inflight.insert(
                        task_id,
                        Inflight {
                            site,
                            started: tokio::time::Instant::now(),
                            handle,
                        },
                    );
                    self.stats.record_dispatched();
                }
                None => {
                    blocked_sites.insert(task.target_site.clone());
                    self.pool.check_site_exhausted(&task.target_site);
                }
            }
        }
        Ok(())
    }
}

/// Control handle for a spawned scheduler.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    stats: Arc<EngineStats>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Stop the loop and wait for it to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.join.await {
            tracing::warn!(%error, "scheduler task ended abnormally");
        }
    }
}
