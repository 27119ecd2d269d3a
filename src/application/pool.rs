//! Browser session pool
//!
//! Owns a fixed-size collection of automation sessions: creates them on
//! demand up to the configured size, probes liveness on every acquire and
//! transparently replaces dead handles, and blocks acquirers cooperatively
//! when every session is busy.
//!
//! Locking: the idle/busy partition, the per-session site states and the
//! rate-governor state are read and mutated together on every scheduling
//! decision, so all three live behind one coarse `std::sync::Mutex`. The lock
//! is only held for non-suspending mutations; driver I/O (create, probe,
//! dispose) always happens outside it with the affected session already
//! claimed or removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

use crate::application::rate_governor::{RateConfig, SessionGovernor};
use crate::domain::clock::Clock;
use crate::domain::collaborators::{BrowserDriver, DriverError, DriverSession};
use crate::domain::events::PoolEvent;
use crate::domain::session::{SessionId, SessionRecord, SessionSnapshot, new_session_id};
use crate::domain::site_state::SiteStatus;

/// How long a blocked acquirer sleeps between eligibility re-checks. Penalty
/// expiry is time-based and does not wake the `Notify`, so waiters re-poll at
/// this cadence instead of spinning.
const ACQUIRE_RECHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Fixed pool size. Real browser sessions are expensive and each one is
    /// a logged-in identity, so the default is deliberately small.
    pub size: usize,

    /// Default acquire timeout for callers that do not pick their own.
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            acquire_timeout_secs: 30,
        }
    }
}

/// Pool-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no session available within {0:?}")]
    AcquireTimeout(Duration),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

struct SessionEntry {
    record: SessionRecord,
    handle: DriverSession,
    governor: SessionGovernor,
}

struct PoolState {
    target_size: usize,
    entries: HashMap<SessionId, SessionEntry>,
    /// Sessions currently being created; counted against the target so
    /// concurrent acquirers cannot overshoot it.
    creating: usize,
    /// Last session that produced a success; handed out first while it stays
    /// eligible so one logged-in identity stays warm.
    preferred: Option<SessionId>,
    /// Handles removed from the pool but not yet disposed (disposal is async,
    /// removal is not).
    graveyard: Vec<DriverSession>,
    /// Sites for which an exhaustion event was already emitted this episode.
    exhausted_sites: HashSet<String>,
}

impl PoolState {
    fn live_count(&self) -> usize {
        self.entries.len() + self.creating
    }

    fn claim_idle(
        &mut self,
        site: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<(SessionId, DriverSession)> {
        let mut order: Vec<SessionId> = Vec::with_capacity(self.entries.len());
        if let Some(preferred) = &self.preferred {
            if self.entries.contains_key(preferred) {
                order.push(preferred.clone());
            }
        }
        for id in self.entries.keys() {
            if self.preferred.as_ref() != Some(id) {
                order.push(id.clone());
            }
        }

        for id in order {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.record.busy {
                continue;
            }
            if let Some(site) = site {
                if !entry.record.is_site_available(site, now) {
                    continue;
                }
                if entry.governor.is_penalized(site, now) {
                    continue;
                }
                if !entry.governor.try_admit() {
                    continue;
                }
            }
            entry.record.busy = true;
            entry.record.used_count += 1;
            return Some((id, entry.handle.clone()));
        }
        None
    }

    fn drop_preferred_if(&mut self, id: &SessionId) {
        if self.preferred.as_ref() == Some(id) {
            self.preferred = None;
        }
    }
}

struct PoolInner {
    driver: Arc<dyn BrowserDriver>,
    clock: Arc<dyn Clock>,
    rate: RateConfig,
    state: Mutex<PoolState>,
    notify: Notify,
    events: broadcast::Sender<PoolEvent>,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one pooled session for the duration of one job.
///
/// Dropping the lease returns the session to the idle set on every exit path,
/// including panics and watchdog aborts; a session can never leak as
/// permanently busy.
pub struct SessionLease {
    inner: Arc<PoolInner>,
    session_id: SessionId,
    handle: DriverSession,
    released: bool,
}

impl SessionLease {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn session(&self) -> &DriverSession {
        &self.handle
    }

    /// Tear this session down instead of returning it to the idle set (e.g.
    /// to force a clean session after a severe error). The pool creates a
    /// replacement so its size stays constant.
    pub async fn dispose(mut self) {
        self.released = true;
        let inner = Arc::clone(&self.inner);
        let id = self.session_id.clone();
        {
            let mut state = inner.lock_state();
            state.entries.remove(&id);
            state.drop_preferred_if(&id);
        }
        if let Err(error) = inner.driver.dispose(self.handle.clone()).await {
            tracing::debug!(session_id = %id, %error, "disposing session failed");
        }
        tracing::info!(session_id = %id, "session disposed on request");
        let pool = SessionPool { inner };
        pool.ensure_capacity().await;
        pool.inner.notify.notify_waiters();
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.released {
            release_to_idle(&self.inner, &self.session_id);
        }
    }
}

/// Returns a session to the idle set. Runs synchronously so it is safe from
/// `Drop`; any retirement this triggers (after a shrink) only moves the
/// handle to the graveyard for the next async sweep.
fn release_to_idle(inner: &Arc<PoolInner>, id: &SessionId) {
    {
        let mut state = inner.lock_state();
        let mut retire = false;
        match state.entries.get_mut(id) {
            Some(entry) => {
                debug_assert!(entry.record.busy, "releasing a session that is not busy");
                entry.record.busy = false;
                retire = state.entries.len() > state.target_size;
            }
            None => {
                tracing::debug!(session_id = %id, "released session is no longer pooled");
            }
        }
        if retire {
            if let Some(entry) = state.entries.remove(id) {
                state.graveyard.push(entry.handle);
                tracing::info!(session_id = %id, "retired surplus session after resize");
            }
            state.drop_preferred_if(id);
        }
    }
    inner.notify.notify_waiters();
}

enum AcquireStep {
    Probe(SessionId, DriverSession),
    Create,
    Wait,
}

/// Fixed-size pool of authenticated browser sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        clock: Arc<dyn Clock>,
        config: PoolConfig,
        rate: RateConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(PoolInner {
                driver,
                clock,
                rate,
                state: Mutex::new(PoolState {
                    target_size: config.size.max(1),
                    entries: HashMap::new(),
                    creating: 0,
                    preferred: None,
                    graveyard: Vec::new(),
                    exhausted_sites: HashSet::new(),
                }),
                notify: Notify::new(),
                events,
            }),
        }
    }

    /// Subscribe to operator-visible pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Acquire any session, blocking cooperatively up to `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<SessionLease, PoolError> {
        self.acquire_inner(None, timeout).await
    }

    /// Acquire a session eligible for `site` (site state available, no
    /// penalty window, bucket token consumed), blocking up to `timeout`.
    pub async fn acquire_for_site(
        &self,
        site: &str,
        timeout: Duration,
    ) -> Result<SessionLease, PoolError> {
        self.acquire_inner(Some(site), timeout).await
    }

    /// Non-blocking variant used by the scheduler's dispatch pass.
    pub async fn try_acquire_for_site(&self, site: &str) -> Option<SessionLease> {
        self.attempt(Some(site)).await
    }

    async fn acquire_inner(
        &self,
        site: Option<&str>,
        timeout: Duration,
    ) -> Result<SessionLease, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeups before scanning so a release between the
            // failed scan and the wait cannot be lost.
            let notified = self.inner.notify.notified();
            if let Some(lease) = self.attempt(site).await {
                return Ok(lease);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(PoolError::AcquireTimeout(timeout));
            }
            let wait_until = deadline.min(now + ACQUIRE_RECHECK_INTERVAL);
            let _ = tokio::time::timeout_at(wait_until, notified).await;
        }
    }

    /// One acquisition pass: claim an idle eligible session (replacing dead
    /// ones as they are discovered) or create a new one below capacity.
    async fn attempt(&self, site: Option<&str>) -> Option<SessionLease> {
        // Bounded so an endpoint whose probes always fail cannot trap an
        // acquirer in a replace loop.
        let mut replacements = 0u32;
        loop {
            let step = {
                let mut state = self.inner.lock_state();
                let now = self.inner.clock.now();
                if let Some((id, handle)) = state.claim_idle(site, now) {
                    AcquireStep::Probe(id, handle)
                } else if state.live_count() < state.target_size {
                    state.creating += 1;
                    AcquireStep::Create
                } else {
                    AcquireStep::Wait
                }
            };

            match step {
                AcquireStep::Probe(id, handle) => {
                    match self.inner.driver.probe(&handle).await {
                        Ok(true) => return Some(self.lease(id, handle)),
                        Ok(false) | Err(_) => {
                            self.replace_dead(&id, handle).await;
                            replacements += 1;
                            if replacements >= 3 {
                                return None;
                            }
                            // Rescan: the replacement (or another idle
                            // session) may satisfy this acquire.
                        }
                    }
                }
                AcquireStep::Create => match self.inner.driver.create_session().await {
                    Ok(handle) => {
                        let id = new_session_id();
                        let now = self.inner.clock.now();
                        let mut record = SessionRecord::new(id.clone(), now);
                        record.busy = true;
                        record.used_count = 1;
                        let governor = SessionGovernor::new(&self.inner.rate);
                        if site.is_some() {
                            // This acquire is a dispatch: consume its token.
                            let _ = governor.try_admit();
                        }
                        {
                            let mut state = self.inner.lock_state();
                            state.creating -= 1;
                            state.entries.insert(
                                id.clone(),
                                SessionEntry {
                                    record,
                                    handle: handle.clone(),
                                    governor,
                                },
                            );
                            if state.preferred.is_none() {
                                state.preferred = Some(id.clone());
                            }
                        }
                        tracing::info!(session_id = %id, "created browser session");
                        return Some(self.lease(id, handle));
                    }
                    Err(error) => {
                        self.inner.lock_state().creating -= 1;
                        tracing::warn!(%error, "failed to create browser session");
                        return None;
                    }
                },
                AcquireStep::Wait => return None,
            }
        }
    }

    fn lease(&self, session_id: SessionId, handle: DriverSession) -> SessionLease {
        SessionLease {
            inner: Arc::clone(&self.inner),
            session_id,
            handle,
            released: false,
        }
    }

    /// Discard a session that failed its liveness probe and create a
    /// replacement. Invisible to callers except as momentarily reduced
    /// capacity.
    async fn replace_dead(&self, id: &SessionId, handle: DriverSession) {
        {
            let mut state = self.inner.lock_state();
            state.entries.remove(id);
            state.drop_preferred_if(id);
        }
        tracing::warn!(session_id = %id, "session failed liveness probe, replacing");
        if let Err(error) = self.inner.driver.dispose(handle).await {
            tracing::debug!(%error, "disposing dead session failed");
        }
        match self.inner.driver.create_session().await {
            Ok(new_handle) => {
                let now = self.inner.clock.now();
                let new_id = new_session_id();
                {
                    let mut state = self.inner.lock_state();
                    if state.live_count() < state.target_size {
                        state.entries.insert(
                            new_id.clone(),
                            SessionEntry {
                                record: SessionRecord::new(new_id.clone(), now),
                                handle: new_handle,
                                governor: SessionGovernor::new(&self.inner.rate),
                            },
                        );
                    } else {
                        // The pool shrank while we were replacing.
                        state.graveyard.push(new_handle);
                    }
                }
                let _ = self.inner.events.send(PoolEvent::SessionReplaced {
                    retired: id.clone(),
                    replacement: new_id,
                    timestamp: now,
                });
                self.inner.notify.notify_waiters();
            }
            Err(error) => {
                tracing::warn!(%error, "failed to replace dead session");
            }
        }
    }

    /// Create sessions until the pool reaches its target size. Called at
    /// startup and after disposals/resizes.
    pub async fn ensure_capacity(&self) {
        loop {
            {
                let mut state = self.inner.lock_state();
                if state.live_count() >= state.target_size {
                    return;
                }
                state.creating += 1;
            }
            match self.inner.driver.create_session().await {
                Ok(handle) => {
                    let now = self.inner.clock.now();
                    let id = new_session_id();
                    {
                        let mut state = self.inner.lock_state();
                        state.creating -= 1;
                        state.entries.insert(
                            id.clone(),
                            SessionEntry {
                                record: SessionRecord::new(id.clone(), now),
                                handle,
                                governor: SessionGovernor::new(&self.inner.rate),
                            },
                        );
                    }
                    tracing::info!(session_id = %id, "created browser session");
                    self.inner.notify.notify_waiters();
                }
                Err(error) => {
                    self.inner.lock_state().creating -= 1;
                    tracing::warn!(%error, "failed to create browser session");
                    return;
                }
            }
        }
    }

    /// Alias for the startup path: create the initial sessions eagerly so
    /// the first tasks do not pay the creation latency.
    pub async fn warm_up(&self) {
        self.ensure_capacity().await;
        let state = self.inner.lock_state();
        tracing::info!(
            sessions = state.entries.len(),
            target = state.target_size,
            "session pool warmed up"
        );
    }

    /// Operator-driven resize. Idle sessions are closed first; busy sessions
    /// are never force-killed; the pool converges as they are released.
    pub async fn resize(&self, new_size: usize) {
        let new_size = new_size.max(1);
        {
            let mut state = self.inner.lock_state();
            state.target_size = new_size;
            while state.entries.len() > new_size {
                let Some(id) = state
                    .entries
                    .iter()
                    .find(|(_, entry)| !entry.record.busy)
                    .map(|(id, _)| id.clone())
                else {
                    break;
                };
                if let Some(entry) = state.entries.remove(&id) {
                    state.graveyard.push(entry.handle);
                }
                state.drop_preferred_if(&id);
            }
        }
        self.sweep().await;
        self.ensure_capacity().await;
        tracing::info!(new_size, "session pool resized");
    }

    /// Dispose handles that were removed from the pool while a sync context
    /// held the lock. Cheap no-op when the graveyard is empty.
    pub async fn sweep(&self) {
        let doomed: Vec<DriverSession> = {
            let mut state = self.inner.lock_state();
            std::mem::take(&mut state.graveyard)
        };
        for handle in doomed {
            if let Err(error) = self.inner.driver.dispose(handle).await {
                tracing::debug!(%error, "disposing retired session failed");
            }
        }
    }

    /// Tear down every session. Only called on process shutdown, after the
    /// scheduler has stopped dispatching.
    pub async fn shutdown(&self) {
        let handles: Vec<DriverSession> = {
            let mut state = self.inner.lock_state();
            state.preferred = None;
            state.exhausted_sites.clear();
            let mut handles: Vec<DriverSession> =
                state.entries.drain().map(|(_, entry)| entry.handle).collect();
            handles.append(&mut state.graveyard);
            handles
        };
        for handle in handles {
            if let Err(error) = self.inner.driver.dispose(handle).await {
                tracing::debug!(%error, "disposing session on shutdown failed");
            }
        }
        tracing::info!("session pool shut down");
    }

    // ------------------------------------------------------------------
    // Tracker / governor updates (called by the execution wrapper while it
    // still holds the session exclusively)
    // ------------------------------------------------------------------

    /// Classified success: reset site state and penalty escalation, and make
    /// this session the preferred one.
    pub fn record_success(&self, id: &SessionId, site: &str) {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock_state();
        if let Some(entry) = state.entries.get_mut(id) {
            entry.record.site_state_mut(site).mark_success(now);
            entry.record.last_success_at = Some(now);
            entry.governor.record_success(site);
        }
        state.preferred = Some(id.clone());
        state.exhausted_sites.remove(site);
    }

    /// Classified throttling signal: escalate the session's penalty window
    /// and block the site until it expires. Returns the deadline.
    pub fn record_rate_limited(
        &self,
        id: &SessionId,
        site: &str,
        message: &str,
    ) -> Option<DateTime<Utc>> {
        let now = self.inner.clock.now();
        let rate = self.inner.rate.clone();
        let mut state = self.inner.lock_state();
        let until = state.entries.get_mut(id).map(|entry| {
            let until = entry.governor.apply_penalty(site, &rate, now);
            entry
                .record
                .site_state_mut(site)
                .mark_rate_limited(until, message);
            until
        });
        state.drop_preferred_if(id);
        if let Some(until) = until {
            tracing::warn!(
                session_id = %id,
                site,
                blocked_until = %until,
                "session rate limited"
            );
        }
        until
    }

    /// Classified authentication signal. Returns `true` when every live
    /// session now requires login for `site`: the operator-attention
    /// condition, also broadcast as a pool event.
    pub fn record_login_required(&self, id: &SessionId, site: &str, message: &str) -> bool {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock_state();
        if let Some(entry) = state.entries.get_mut(id) {
            entry.record.site_state_mut(site).mark_login_required(message);
        }
        state.drop_preferred_if(id);
        let all_blocked = !state.entries.is_empty()
            && state.entries.values().all(|entry| {
                entry
                    .record
                    .sites
                    .get(site)
                    .is_some_and(|s| s.status == SiteStatus::LoginRequired)
            });
        drop(state);
        tracing::warn!(session_id = %id, site, "session requires login");
        if all_blocked {
            let _ = self.inner.events.send(PoolEvent::AllSessionsLoginRequired {
                site: site.to_string(),
                timestamp: now,
            });
        }
        all_blocked
    }

    /// Generic failure: soft-mark the site state; the session stays
    /// dispatchable.
    pub fn record_error(&self, id: &SessionId, site: &str, message: &str) {
        let mut state = self.inner.lock_state();
        if let Some(entry) = state.entries.get_mut(id) {
            entry.record.site_state_mut(site).mark_error(message);
        }
    }

    /// Manual recovery hook: an operator re-authenticated the session.
    pub fn clear_login_required(&self, id: &SessionId, site: &str) -> Result<(), PoolError> {
        {
            let mut state = self.inner.lock_state();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| PoolError::UnknownSession(id.clone()))?;
            entry.record.site_state_mut(site).clear_login_required();
            state.exhausted_sites.remove(site);
        }
        tracing::info!(session_id = %id, site, "login-required state cleared");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Emit a `SiteExhausted` event the first time a dispatch pass finds no
    /// session eligible for `site` (busy sessions aside); cleared once any
    /// session is eligible again.
    pub fn check_site_exhausted(&self, site: &str) {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock_state();
        if state.entries.is_empty() {
            return;
        }
        let mut any_eligible = false;
        let mut earliest: Option<DateTime<Utc>> = None;
        for entry in state.entries.values_mut() {
            if entry.record.is_site_available(site, now) && !entry.governor.is_penalized(site, now)
            {
                any_eligible = true;
            } else {
                let site_deadline = entry
                    .record
                    .site_state_mut(site)
                    .blocked_until
                    .filter(|until| *until > now);
                let penalty_deadline = entry.governor.blocked_until(site, now);
                for deadline in [site_deadline, penalty_deadline].into_iter().flatten() {
                    earliest = Some(match earliest {
                        Some(current) => current.min(deadline),
                        None => deadline,
                    });
                }
            }
        }
        if any_eligible {
            state.exhausted_sites.remove(site);
        } else if state.exhausted_sites.insert(site.to_string()) {
            drop(state);
            tracing::error!(site, ?earliest, "all sessions blocked for site");
            let _ = self.inner.events.send(PoolEvent::SiteExhausted {
                site: site.to_string(),
                earliest_unblock_at: earliest,
                timestamp: now,
            });
        }
    }

    /// Point-in-time status report.
    pub fn status(&self) -> PoolStatus {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock_state();
        let target_size = state.target_size;
        let preferred_session = state.preferred.clone();

        let site_names: HashSet<String> = state
            .entries
            .values()
            .flat_map(|entry| entry.record.sites.keys().cloned())
            .collect();

        let mut sites = HashMap::new();
        for site in site_names {
            let mut available_sessions = 0usize;
            let mut earliest: Option<DateTime<Utc>> = None;
            for entry in state.entries.values_mut() {
                if entry.record.is_site_available(&site, now)
                    && !entry.governor.is_penalized(&site, now)
                {
                    available_sessions += 1;
                } else {
                    let site_deadline = entry
                        .record
                        .site_state_mut(&site)
                        .blocked_until
                        .filter(|until| *until > now);
                    let penalty_deadline = entry.governor.blocked_until(&site, now);
                    for deadline in [site_deadline, penalty_deadline].into_iter().flatten() {
                        earliest = Some(match earliest {
                            Some(current) => current.min(deadline),
                            None => deadline,
                        });
                    }
                }
            }
            sites.insert(
                site,
                SiteAvailability {
                    available_sessions,
                    earliest_unblock_at: earliest,
                },
            );
        }

        let sessions: Vec<SessionSnapshot> = state
            .entries
            .values()
            .map(|entry| entry.record.snapshot(now))
            .collect();
        let size_busy = sessions.iter().filter(|s| s.busy).count();
        let size_total = sessions.len();

        PoolStatus {
            size_total,
            size_idle: size_total - size_busy,
            size_busy,
            target_size,
            preferred_session,
            sessions,
            sites,
        }
    }

    /// Session ids currently pooled (test and operator convenience).
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.lock_state().entries.keys().cloned().collect()
    }
}

/// Availability summary for one site across the whole pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteAvailability {
    pub available_sessions: usize,
    /// Soonest moment any blocked session unblocks; `None` when the block is
    /// not time-based (login required).
    pub earliest_unblock_at: Option<DateTime<Utc>>,
}

/// Point-in-time pool report exposed to the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub size_total: usize,
    pub size_idle: usize,
    pub size_busy: usize,
    pub target_size: usize,
    pub preferred_session: Option<SessionId>,
    pub sessions: Vec<SessionSnapshot>,
    pub sites: HashMap<String, SiteAvailability>,
}
