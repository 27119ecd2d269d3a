//! Chrome DevTools driver adapter
//!
//! Talks to a locally running Chrome started with `--remote-debugging-port`
//! through its HTTP endpoint: `/json/new` to open a tab, `/json/list` as the
//! liveness probe, `/json/close/<id>` to tear one down. The engine treats the
//! resulting handle as opaque; the site crawlers attach to the returned
//! WebSocket debugger URL themselves.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::domain::collaborators::{BrowserDriver, DriverError, DriverSession};

/// DevTools endpoint configuration.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Root of the remote-debugging HTTP endpoint.
    pub debug_endpoint: String,

    /// Page every fresh session is navigated to, so the operator can log the
    /// new window in before it picks up work.
    pub start_url: String,

    /// Timeout for endpoint calls, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            debug_endpoint: "http://localhost:9222".to_string(),
            start_url: "https://www.kongfz.com/".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TargetInfo {
    id: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    web_socket_debugger_url: Option<String>,
}

pub struct CdpDriver {
    endpoint: Url,
    client: reqwest::Client,
    start_url: String,
}

impl CdpDriver {
    pub fn new(config: &DriverConfig) -> anyhow::Result<Self> {
        use anyhow::Context;
        let endpoint = Url::parse(&config.debug_endpoint)
            .with_context(|| format!("invalid DevTools endpoint: {}", config.debug_endpoint))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            endpoint,
            client,
            start_url: config.start_url.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, DriverError> {
        self.endpoint
            .join(path)
            .map_err(|e| DriverError::Protocol(format!("invalid endpoint path {path}: {e}")))
    }

    /// Browser version info; used as the startup reachability check.
    pub async fn version(&self) -> Result<serde_json::Value, DriverError> {
        let url = self.url("/json/version")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DriverError::Unreachable(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl BrowserDriver for CdpDriver {
    async fn create_session(&self) -> Result<DriverSession, DriverError> {
        let mut url = self.url("/json/new")?;
        url.set_query(Some(&self.start_url));

        // Modern Chrome requires PUT for /json/new.
        let response = self
            .client
            .put(url)
            .send()
            .await
            .map_err(|e| DriverError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DriverError::Protocol(format!(
                "/json/new returned {}",
                response.status()
            )));
        }
        let target: TargetInfo = response
            .json()
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        let ws_url = target
            .web_socket_debugger_url
            .ok_or_else(|| DriverError::Protocol("target has no webSocketDebuggerUrl".into()))?;

        tracing::info!(target_id = %target.id, "opened browser target");
        Ok(DriverSession {
            target_id: target.id,
            ws_url,
        })
    }

    async fn probe(&self, session: &DriverSession) -> Result<bool, DriverError> {
        let url = self.url("/json/list")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DriverError::Unreachable(e.to_string()))?;
        let targets: Vec<TargetInfo> = response
            .json()
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        Ok(targets.iter().any(|t| t.id == session.target_id))
    }

    async fn dispose(&self, session: DriverSession) -> Result<(), DriverError> {
        let url = self.url(&format!("/json/close/{}", session.target_id))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DriverError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DriverError::Protocol(format!(
                "/json/close returned {}",
                response.status()
            )));
        }
        tracing::debug!(target_id = %session.target_id, "closed browser target");
        Ok(())
    }
}
