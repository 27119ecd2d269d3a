//! Per (session, site) availability state machine
//!
//! Each browser session tracks an independent availability record per target
//! site. Timed penalties expire lazily on read: `is_available` compares the
//! stored deadline against the injected clock and reverts the state in place,
//! so no background sweeper is needed.
//!
//! Transition rules:
//! - a classified throttling signal moves the site to `RateLimited` with a
//!   deadline; the state is available again from the deadline onward
//!   (boundary inclusive);
//! - a classified authentication signal moves it to `LoginRequired`, which
//!   never expires by time; only an explicit operator clearance releases it;
//! - a generic failure moves it to `Errored`, which is soft: the session may
//!   still be dispatched for the site and the next success clears it;
//! - any classified success resets the record to `Available`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Availability of one site on one session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Available,
    RateLimited,
    LoginRequired,
    Errored,
}

/// Mutable availability record for one (session, site) pair.
///
/// Never mutated concurrently for the same pair: the owning session is held
/// exclusively while a job runs against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteState {
    pub site: String,
    pub status: SiteStatus,
    pub blocked_until: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
}

impl SiteState {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            status: SiteStatus::Available,
            blocked_until: None,
            error_count: 0,
            last_success_at: None,
            last_error_message: None,
        }
    }

    /// Whether a job may be dispatched against this site right now.
    ///
    /// Performs the lazy penalty expiry as a side effect; safe to call under
    /// the pool lock (pure time comparison, no I/O).
    pub fn is_available(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            SiteStatus::Available => true,
            // Soft failure state: still dispatchable, cleared by the next
            // success.
            SiteStatus::Errored => true,
            SiteStatus::LoginRequired => false,
            SiteStatus::RateLimited => {
                let expired = self.blocked_until.is_none_or(|until| now >= until);
                if expired {
                    self.status = SiteStatus::Available;
                    self.blocked_until = None;
                }
                expired
            }
        }
    }

    /// Classified throttling signal: block the site until `blocked_until`.
    pub fn mark_rate_limited(&mut self, blocked_until: DateTime<Utc>, message: impl Into<String>) {
        self.status = SiteStatus::RateLimited;
        self.blocked_until = Some(blocked_until);
        self.error_count += 1;
        self.last_error_message = Some(message.into());
    }

    /// Classified authentication signal: block until operator clearance.
    pub fn mark_login_required(&mut self, message: impl Into<String>) {
        self.status = SiteStatus::LoginRequired;
        self.blocked_until = None;
        self.error_count += 1;
        self.last_error_message = Some(message.into());
    }

    /// Generic failure: record and keep the session dispatchable.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = SiteStatus::Errored;
        self.error_count += 1;
        self.last_error_message = Some(message.into());
    }

    /// Classified success: unconditionally reset to `Available`.
    pub fn mark_success(&mut self, now: DateTime<Utc>) {
        self.status = SiteStatus::Available;
        self.blocked_until = None;
        self.error_count = 0;
        self.last_success_at = Some(now);
        self.last_error_message = None;
    }

    /// Operator clearance after re-authenticating the session.
    ///
    /// Only releases a `LoginRequired` state; calling it in any other state
    /// is a no-op so the recovery hook is idempotent.
    pub fn clear_login_required(&mut self) {
        if self.status == SiteStatus::LoginRequired {
            self.status = SiteStatus::Available;
        }
    }

    /// Read-only snapshot for status reporting.
    pub fn view(&self, now: DateTime<Utc>) -> SiteStateView {
        SiteStateView {
            status: self.status,
            blocked_until: self.blocked_until.filter(|until| *until > now),
            error_count: self.error_count,
            last_success_at: self.last_success_at,
            last_error_message: self.last_error_message.clone(),
        }
    }
}

/// Serializable site-state snapshot exposed through the pool status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteStateView {
    pub status: SiteStatus,
    pub blocked_until: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_rate_limit_expires_at_boundary() {
        let now = t0();
        let mut state = SiteState::new("kongfuzi");
        state.mark_rate_limited(now + Duration::minutes(6), "throttled");

        assert!(!state.is_available(now));
        assert!(!state.is_available(now + Duration::minutes(6) - Duration::seconds(1)));
        // Boundary inclusive: available from blocked_until onward.
        assert!(state.is_available(now + Duration::minutes(6)));
        assert_eq!(state.status, SiteStatus::Available);
        assert!(state.blocked_until.is_none());
    }

    #[test]
    fn test_login_required_ignores_time() {
        let now = t0();
        let mut state = SiteState::new("kongfuzi");
        state.mark_login_required("session expired");

        assert!(!state.is_available(now + Duration::days(365)));
        state.clear_login_required();
        assert!(state.is_available(now + Duration::days(365)));
    }

    proptest! {
        #[test]
        fn prop_login_required_never_expires(seconds in 0i64..315_360_000) {
            let mut state = SiteState::new("kongfuzi");
            state.mark_login_required("session expired");
            prop_assert!(!state.is_available(t0() + Duration::seconds(seconds)));
        }
    }

    #[test]
    fn test_success_resets_everything() {
        let now = t0();
        let mut state = SiteState::new("duozhuayu");
        state.mark_error("boom");
        state.mark_error("boom again");
        state.mark_rate_limited(now + Duration::minutes(6), "throttled");
        assert_eq!(state.error_count, 3);

        state.mark_success(now);
        assert_eq!(state.status, SiteStatus::Available);
        assert_eq!(state.error_count, 0);
        assert!(state.blocked_until.is_none());
        assert!(state.last_error_message.is_none());
        assert_eq!(state.last_success_at, Some(now));
    }

    #[test]
    fn test_errored_is_soft() {
        let now = t0();
        let mut state = SiteState::new("kongfuzi");
        state.mark_error("selector drifted");
        assert_eq!(state.status, SiteStatus::Errored);
        assert!(state.is_available(now));
    }

    #[test]
    fn test_clear_login_required_is_idempotent() {
        let mut state = SiteState::new("kongfuzi");
        state.mark_error("boom");
        state.clear_login_required();
        assert_eq!(state.status, SiteStatus::Errored);

        state.mark_login_required("expired");
        state.clear_login_required();
        state.clear_login_required();
        assert_eq!(state.status, SiteStatus::Available);
    }

    #[test]
    fn test_view_hides_stale_deadline() {
        let now = t0();
        let mut state = SiteState::new("kongfuzi");
        state.mark_rate_limited(now + Duration::minutes(6), "throttled");

        let view = state.view(now);
        assert_eq!(view.blocked_until, Some(now + Duration::minutes(6)));
        let later = state.view(now + Duration::minutes(10));
        assert!(later.blocked_until.is_none());
    }
}
