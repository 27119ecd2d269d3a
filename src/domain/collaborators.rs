//! External collaborator contracts
//!
//! The engine consumes two collaborators it never looks inside of:
//!
//! - the **browser driver**, which launches and tears down automation
//!   sessions (the engine only holds the resulting handle), and
//! - the **site crawlers**, one per marketplace, which run the actual
//!   page-walking logic against a borrowed session.
//!
//! All calls are fallible I/O with no internal retry assumed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::task::TaskKind;

/// Opaque handle to one live browser page/context.
///
/// The fields identify the remote target; the engine never speaks the
/// automation protocol itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverSession {
    /// Target id assigned by the automation endpoint.
    pub target_id: String,
    /// WebSocket debugger URL for the site crawlers to attach to.
    pub ws_url: String,
}

/// Errors from the automation driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("automation endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("automation protocol error: {0}")]
    Protocol(String),
}

/// Browser automation driver: session creation, liveness, teardown.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Create a fresh authenticated-capable session.
    async fn create_session(&self) -> Result<DriverSession, DriverError>;

    /// Cheap liveness probe. `Ok(false)` means the handle is dead and should
    /// be discarded and replaced.
    async fn probe(&self, session: &DriverSession) -> Result<bool, DriverError>;

    /// Tear the session down. Best effort; a failed dispose is logged, not
    /// retried.
    async fn dispose(&self, session: DriverSession) -> Result<(), DriverError>;
}

/// Classified outcome of one crawl execution.
///
/// The execution wrapper maps each variant onto tracker and governor state;
/// none of them is ever escalated as process-fatal.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CrawlError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("login required: {0}")]
    LoginRequired(String),

    #[error("{0}")]
    Failed(String),
}

impl CrawlError {
    /// Classify a raw error message the way the marketplaces actually signal:
    /// throttling and auth walls surface as recognizable text, everything
    /// else is generic.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if lowered.contains("rate_limited") || lowered.contains("rate limit") {
            CrawlError::RateLimited(message)
        } else if lowered.contains("login_required") || lowered.contains("login required") {
            CrawlError::LoginRequired(message)
        } else {
            CrawlError::Failed(message)
        }
    }
}

/// Site-specific crawl logic. One implementation per marketplace.
///
/// The engine passes the borrowed session handle and the typed task payload;
/// the crawler returns a JSON result for the business layer or a classified
/// error. The engine never inspects page content.
#[async_trait]
pub trait SiteCrawler: Send + Sync {
    async fn execute(
        &self,
        session: &DriverSession,
        task: &TaskKind,
    ) -> Result<serde_json::Value, CrawlError>;
}

/// Maps site names to their crawler implementations.
#[derive(Default)]
pub struct CrawlerRegistry {
    crawlers: HashMap<String, Arc<dyn SiteCrawler>>,
}

impl CrawlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, site: impl Into<String>, crawler: Arc<dyn SiteCrawler>) {
        self.crawlers.insert(site.into(), crawler);
    }

    pub fn get(&self, site: &str) -> Option<Arc<dyn SiteCrawler>> {
        self.crawlers.get(site).cloned()
    }

    pub fn sites(&self) -> Vec<String> {
        self.crawlers.keys().cloned().collect()
    }
}
