//! Per-session request-rate governance
//!
//! Two independent layers, because they answer different questions:
//!
//! - the **token bucket** caps how fast *we* are willing to call out on one
//!   session ("are we calling too fast?"); an empty bucket defers dispatch,
//!   it is never an error;
//! - the **penalty window** reacts to throttling *the remote site itself*
//!   signalled ("have they flagged us?"); it escalates with consecutive
//!   penalties and only a classified success resets it. Penalties are
//!   tracked per target site, so a session flagged by one marketplace keeps
//!   working against the other.
//!
//! A full bucket does not clear an active penalty and vice versa; dispatch
//! checks both.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

/// Rate-governance tunables, one instance shared by every session governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Token-bucket burst capacity per session.
    pub bucket_capacity: u32,

    /// Window over which the bucket refills completely, in seconds.
    pub bucket_window_secs: u64,

    /// Base penalty applied on an externally observed throttling signal.
    pub penalty_base_secs: u64,

    /// Escalation cap: the penalty grows linearly with consecutive
    /// penalties up to `base * max_multiplier`.
    pub penalty_max_multiplier: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 10,
            bucket_window_secs: 60,
            penalty_base_secs: 6 * 60,
            penalty_max_multiplier: 3,
        }
    }
}

impl RateConfig {
    fn quota(&self) -> Quota {
        let capacity = NonZeroU32::new(self.bucket_capacity).unwrap_or(NonZeroU32::MIN);
        let window = Duration::from_secs(self.bucket_window_secs.max(1));
        Quota::with_period(window / capacity.get())
            .unwrap_or_else(|| Quota::per_minute(capacity))
            .allow_burst(capacity)
    }
}

/// Escalating backoff record for externally observed throttling of one
/// (session, site) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PenaltyState {
    pub blocked_until: Option<DateTime<Utc>>,
    pub consecutive_penalties: u32,
}

/// Rate governance state for one session: one shared token bucket plus a
/// penalty record per target site.
pub struct SessionGovernor {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    penalties: HashMap<String, PenaltyState>,
}

impl SessionGovernor {
    pub fn new(config: &RateConfig) -> Self {
        Self {
            limiter: RateLimiter::direct(config.quota()),
            penalties: HashMap::new(),
        }
    }

    /// Consume one bucket token if available. `false` means the session must
    /// not start another request right now; the scheduler defers the task.
    pub fn try_admit(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Whether an externally applied penalty window is still active for
    /// `site`.
    pub fn is_penalized(&self, site: &str, now: DateTime<Utc>) -> bool {
        self.penalties
            .get(site)
            .and_then(|penalty| penalty.blocked_until)
            .is_some_and(|until| now < until)
    }

    /// Apply (and escalate) the penalty window after a throttling signal
    /// from `site`. Returns the new deadline.
    pub fn apply_penalty(
        &mut self,
        site: &str,
        config: &RateConfig,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let penalty = self.penalties.entry(site.to_string()).or_default();
        penalty.consecutive_penalties = penalty.consecutive_penalties.saturating_add(1);
        let multiplier = penalty
            .consecutive_penalties
            .min(config.penalty_max_multiplier.max(1));
        let duration =
            ChronoDuration::seconds((config.penalty_base_secs * u64::from(multiplier)) as i64);
        let until = now + duration;
        penalty.blocked_until = Some(until);
        until
    }

    /// A classified success against `site` resets its escalation.
    pub fn record_success(&mut self, site: &str) {
        self.penalties.remove(site);
    }

    pub fn penalty(&self, site: &str) -> Option<&PenaltyState> {
        self.penalties.get(site)
    }

    /// Active penalty deadline for `site`, if any.
    pub fn blocked_until(&self, site: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.penalties
            .get(site)
            .and_then(|penalty| penalty.blocked_until)
            .filter(|until| *until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SITE: &str = "kongfuzi";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_bucket_defers_after_capacity() {
        let config = RateConfig::default();
        let governor = SessionGovernor::new(&config);

        for i in 0..10 {
            assert!(governor.try_admit(), "request {} should be admitted", i + 1);
        }
        assert!(!governor.try_admit(), "11th request must be deferred");
    }

    #[test]
    fn test_penalty_escalates_and_caps() {
        let config = RateConfig::default();
        let mut governor = SessionGovernor::new(&config);
        let now = t0();

        let first = governor.apply_penalty(SITE, &config, now);
        assert_eq!(first, now + ChronoDuration::seconds(360));

        let second = governor.apply_penalty(SITE, &config, now);
        assert_eq!(second, now + ChronoDuration::seconds(720));

        let third = governor.apply_penalty(SITE, &config, now);
        assert_eq!(third, now + ChronoDuration::seconds(1080));

        // Capped at 3x no matter how many more penalties accumulate.
        let fourth = governor.apply_penalty(SITE, &config, now);
        assert_eq!(fourth, now + ChronoDuration::seconds(1080));
    }

    #[test]
    fn test_success_resets_multiplier() {
        let config = RateConfig::default();
        let mut governor = SessionGovernor::new(&config);
        let now = t0();

        governor.apply_penalty(SITE, &config, now);
        governor.apply_penalty(SITE, &config, now);
        assert_eq!(governor.penalty(SITE).unwrap().consecutive_penalties, 2);

        governor.record_success(SITE);
        assert!(governor.penalty(SITE).is_none());
        assert!(!governor.is_penalized(SITE, now));

        // Escalation starts over from the base duration.
        let again = governor.apply_penalty(SITE, &config, now);
        assert_eq!(again, now + ChronoDuration::seconds(360));
    }

    #[test]
    fn test_penalty_scoped_to_one_site() {
        let config = RateConfig::default();
        let mut governor = SessionGovernor::new(&config);
        let now = t0();

        governor.apply_penalty(SITE, &config, now);
        assert!(governor.is_penalized(SITE, now));
        // The other marketplace on the same session is untouched.
        assert!(!governor.is_penalized("duozhuayu", now));
    }

    #[test]
    fn test_penalty_independent_of_bucket() {
        let config = RateConfig::default();
        let mut governor = SessionGovernor::new(&config);
        let now = t0();

        governor.apply_penalty(SITE, &config, now);
        // Bucket still has tokens, but the penalty window stands on its own.
        assert!(governor.try_admit());
        assert!(governor.is_penalized(SITE, now));
        assert!(!governor.is_penalized(SITE, now + ChronoDuration::seconds(360)));
    }
}
