//! Browser session record
//!
//! One session is one authenticated browser page/context, a single logged-in
//! identity. The pool owns the records exclusively; a job borrows a session
//! for the duration of one execution-wrapper run only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::site_state::{SiteState, SiteStateView};

/// Stable session identity assigned by the pool (uuid v4).
pub type SessionId = String;

/// Allocate a fresh session id.
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

/// Bookkeeping for one pooled session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    pub busy: bool,
    pub created_at: DateTime<Utc>,
    pub used_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Independent availability record per target site.
    pub sites: HashMap<String, SiteState>,
}

impl SessionRecord {
    pub fn new(id: SessionId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            busy: false,
            created_at,
            used_count: 0,
            last_success_at: None,
            sites: HashMap::new(),
        }
    }

    /// Availability record for `site`, created as `Available` on first touch.
    pub fn site_state_mut(&mut self, site: &str) -> &mut SiteState {
        self.sites
            .entry(site.to_string())
            .or_insert_with(|| SiteState::new(site))
    }

    /// Whether `site` may be dispatched on this session (lazy-expires any
    /// elapsed rate-limit penalty as a side effect).
    pub fn is_site_available(&mut self, site: &str, now: DateTime<Utc>) -> bool {
        self.site_state_mut(site).is_available(now)
    }

    /// Read-only snapshot for the pool status report.
    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            busy: self.busy,
            created_at: self.created_at,
            used_count: self.used_count,
            last_success_at: self.last_success_at,
            sites: self
                .sites
                .iter()
                .map(|(name, state)| (name.clone(), state.view(now)))
                .collect(),
        }
    }
}

/// Serializable per-session detail exposed through `PoolStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub busy: bool,
    pub created_at: DateTime<Utc>,
    pub used_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub sites: HashMap<String, SiteStateView>,
}
