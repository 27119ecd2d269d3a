//! Operator-visible pool events
//!
//! Conditions the engine cannot resolve on its own are broadcast so the
//! control surface can alert an operator. Events are advisory: dropping a
//! receiver never blocks the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::SessionId;

/// Broadcast signal emitted by the session pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// Every live session requires re-authentication for `site`; no task for
    /// that site can run until an operator logs a session back in and calls
    /// the clearance hook.
    AllSessionsLoginRequired {
        site: String,
        timestamp: DateTime<Utc>,
    },

    /// Every live session is penalized for `site`. Tasks stay pending;
    /// `earliest_unblock_at` is the soonest any penalty expires (`None` when
    /// only login-required sessions remain).
    SiteExhausted {
        site: String,
        earliest_unblock_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },

    /// A dead session failed its liveness probe and was replaced.
    SessionReplaced {
        retired: SessionId,
        replacement: SessionId,
        timestamp: DateTime<Utc>,
    },
}
