//! Test doubles shared by unit and integration tests
//!
//! A fake clock, a scripted in-memory browser driver, scripted site crawlers
//! and an in-memory task store. Kept in the library so integration tests can
//! use the same doubles as the in-module unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::domain::clock::Clock;
use crate::domain::collaborators::{
    BrowserDriver, CrawlError, DriverError, DriverSession, SiteCrawler,
};
use crate::domain::task::TaskKind;
use crate::infrastructure::task_store::SqliteTaskStore;

/// Manually driven clock.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()),
        }
    }
}

impl FakeClock {
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory browser driver with scripted failures.
#[derive(Debug, Default)]
pub struct MockDriver {
    counter: AtomicUsize,
    dead: Mutex<HashSet<String>>,
    disposed: Mutex<Vec<String>>,
    fail_create: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `probe` report this target as dead from now on.
    pub fn mark_dead(&self, target_id: &str) {
        self.dead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target_id.to_string());
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn disposed_targets(&self) -> Vec<String> {
        self.disposed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn create_session(&self) -> Result<DriverSession, DriverError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(DriverError::Unreachable("mock create failure".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(DriverSession {
            target_id: format!("mock-target-{n}"),
            ws_url: format!("ws://mock/devtools/page/{n}"),
        })
    }

    async fn probe(&self, session: &DriverSession) -> Result<bool, DriverError> {
        let dead = self.dead.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(!dead.contains(&session.target_id))
    }

    async fn dispose(&self, session: DriverSession) -> Result<(), DriverError> {
        self.disposed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session.target_id);
        Ok(())
    }
}

/// Site crawler that replays a scripted sequence of outcomes (success once
/// the script runs dry) and records every payload it executed, in order.
pub struct ScriptedCrawler {
    script: Mutex<VecDeque<Result<serde_json::Value, CrawlError>>>,
    executed: Mutex<Vec<TaskKind>>,
    delay: Duration,
}

impl ScriptedCrawler {
    /// Always succeeds.
    pub fn ok() -> Self {
        Self::with_script(Vec::new())
    }

    pub fn with_script(script: Vec<Result<serde_json::Value, CrawlError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            executed: Mutex::new(Vec::new()),
            delay: Duration::from_millis(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Task payloads executed so far, in dispatch order.
    pub fn executed(&self) -> Vec<TaskKind> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SiteCrawler for ScriptedCrawler {
    async fn execute(
        &self,
        _session: &DriverSession,
        task: &TaskKind,
    ) -> Result<serde_json::Value, CrawlError> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(serde_json::json!({"ok": true})))
    }
}

/// Site crawler whose job never returns; for exercising the timeout
/// watchdog.
#[derive(Debug, Default)]
pub struct HangingCrawler;

#[async_trait]
impl SiteCrawler for HangingCrawler {
    async fn execute(
        &self,
        _session: &DriverSession,
        _task: &TaskKind,
    ) -> Result<serde_json::Value, CrawlError> {
        futures::future::pending::<()>().await;
        unreachable!()
    }
}

/// Fresh migrated task store on an in-memory sqlite database.
pub async fn memory_task_store(clock: Arc<FakeClock>) -> SqliteTaskStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory sqlite");
    let store = SqliteTaskStore::new(pool, clock);
    store.migrate().await.expect("failed to migrate task store");
    store
}
