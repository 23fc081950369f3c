//! Focus session lifecycle.
//!
//! Owns the enable/disable transitions, the 60s heartbeat that keeps the
//! active session's duration fresh on disk, and crash recovery. The
//! invariant maintained here: at most one focus session is active at a
//! time, and `active_session_id` in persisted state always points at it.
//!
//! Durations are only ever widened while a session is active; a stale
//! heartbeat can never shrink what an earlier one recorded.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{CoreError, ValidationError};
use crate::rules::RuleSyncEngine;
use crate::store::StateStore;
use crate::types::{local_date, FocusSession, SessionStatus};

/// Cached identity of the running session, so heartbeats do not need a
/// state read.
#[derive(Debug, Clone)]
struct ActiveSession {
    id: String,
    date: NaiveDate,
    start_instant: DateTime<Utc>,
}

/// Session lifecycle manager.
pub struct FocusController {
    store: Arc<StateStore>,
    rules: Arc<RuleSyncEngine>,
    user_id: Option<String>,
    heartbeat_secs: u64,
    offset_minutes: i32,
    lookback_days: u32,
    active: Mutex<Option<ActiveSession>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl FocusController {
    pub fn new(store: Arc<StateStore>, rules: Arc<RuleSyncEngine>, config: &EngineConfig) -> Self {
        Self {
            store,
            rules,
            user_id: config.user_id.clone(),
            heartbeat_secs: config.heartbeat_secs,
            offset_minutes: config.utc_offset_minutes,
            lookback_days: config.sync_lookback_days,
            active: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    /// Whether focus mode is on according to the state mirror.
    pub fn is_enabled(&self) -> bool {
        self.store.state().focus_mode_enabled
    }

    /// Turn focus mode on: create a session record, flip state, start the
    /// heartbeat and reconcile blocking rules.
    ///
    /// Fails closed when no user is configured. Idempotent while already
    /// enabled (only re-runs the rule reconciliation).
    pub async fn enable(self: &Arc<Self>) -> Result<(), CoreError> {
        self.enable_at(Utc::now()).await
    }

    pub async fn enable_at(self: &Arc<Self>, now: DateTime<Utc>) -> Result<(), CoreError> {
        let user_id = self
            .user_id
            .clone()
            .ok_or(ValidationError::MissingUserContext)?;

        if self.store.state().focus_mode_enabled && self.cached().is_some() {
            info!("focus mode already on");
            self.sync_rules_tolerant().await;
            return Ok(());
        }

        // A session id left behind by a crash is closed out before a new
        // session starts, so the at-most-one-active invariant holds even
        // across unclean shutdowns.
        if let Some(stale_id) = self.store.state().active_session_id {
            warn!("closing stale session {stale_id} before starting a new one");
            self.complete_session(&stale_id, now, None).await;
        }

        let session = FocusSession::begin(&user_id, now, self.offset_minutes);
        let session_id = session.id.clone();
        let date = session.calendar_date;
        let record = session.clone();
        self.store
            .update_focus_sessions(date, move |sessions| sessions.push(record))
            .await?;

        let today = local_date(now, self.offset_minutes);
        let id_for_state = session_id.clone();
        self.store
            .update_state(move |s| {
                s.focus_mode_enabled = true;
                s.active_session_id = Some(id_for_state);
                s.stats.roll_to(today);
                s.stats.sessions_today += 1;
            })
            .await?;

        self.set_cached(Some(ActiveSession {
            id: session_id.clone(),
            date,
            start_instant: now,
        }));
        self.spawn_ticker();
        info!("focus session {session_id} started");

        self.sync_rules_tolerant().await;
        Ok(())
    }

    /// Turn focus mode off: complete the session, flip state and drop the
    /// blocking rules.
    ///
    /// State is flipped even when the session record cannot be completed;
    /// the user asked to leave focus mode and enforcement must not outlive
    /// that request.
    pub async fn disable(self: &Arc<Self>) -> Result<(), CoreError> {
        self.disable_at(Utc::now()).await
    }

    pub async fn disable_at(self: &Arc<Self>, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.cancel_ticker();

        let elapsed_ms = if let Some(active) = self.take_cached() {
            let elapsed = (now - active.start_instant).max(Duration::zero());
            self.complete_session(&active.id, now, Some(active.date))
                .await;
            elapsed.num_milliseconds().max(0) as u64
        } else if let Some(stale_id) = self.store.state().active_session_id {
            // Enabled in a previous process life and never recovered.
            self.complete_session(&stale_id, now, None).await;
            0
        } else {
            0
        };

        let today = local_date(now, self.offset_minutes);
        self.store
            .update_state(move |s| {
                s.focus_mode_enabled = false;
                s.active_session_id = None;
                s.stats.roll_to(today);
                s.stats.total_focus_ms += elapsed_ms;
            })
            .await?;

        info!("focus mode off");
        self.sync_rules_tolerant().await;
        Ok(())
    }

    /// One heartbeat: widen the active session's persisted duration.
    ///
    /// Bookkeeping only; failures are logged and the next beat tries again.
    pub async fn heartbeat_at(&self, now: DateTime<Utc>) {
        let Some(active) = self.cached() else {
            return;
        };
        let minutes = (now - active.start_instant).num_minutes().max(0) as u32;
        let id = active.id.clone();
        let result = self
            .store
            .update_focus_sessions(active.date, move |sessions| {
                if let Some(session) = sessions.iter_mut().find(|s| s.id == id) {
                    session.duration_minutes = session.duration_minutes.max(minutes);
                }
            })
            .await;
        if let Err(e) = result {
            warn!("session heartbeat write failed: {e}");
        }
    }

    /// Rebuild in-memory state after a restart.
    ///
    /// If persisted state says focus mode is on, the cached session is
    /// reconstructed from the session partitions (falling back to a fresh
    /// start instant when the record is gone), the heartbeat is re-armed
    /// and rules are reconciled. Enforcement therefore resumes without
    /// any user action.
    pub async fn recover(self: &Arc<Self>) -> Result<(), CoreError> {
        self.recover_at(Utc::now()).await
    }

    pub async fn recover_at(self: &Arc<Self>, now: DateTime<Utc>) -> Result<(), CoreError> {
        let state = self.store.state();
        if !state.focus_mode_enabled {
            self.sync_rules_tolerant().await;
            return Ok(());
        }

        let Some(id) = state.active_session_id else {
            warn!("focus mode on with no session id; starting heartbeat-less recovery");
            self.sync_rules_tolerant().await;
            return Ok(());
        };

        let (date, start) = match self.find_session(&id, now).await {
            Some(session) => (session.calendar_date, session.start_instant),
            None => {
                warn!("active session {id} not found in recent partitions");
                (local_date(now, self.offset_minutes), now)
            }
        };

        self.set_cached(Some(ActiveSession {
            id: id.clone(),
            date,
            start_instant: start,
        }));
        self.spawn_ticker();
        info!("recovered focus session {id}");

        self.sync_rules_tolerant().await;
        Ok(())
    }

    /// Locate a session by id, scanning today's partition first and then
    /// back through the lookback window, so a session that survived a
    /// multi-day outage keeps its original start instant.
    async fn find_session(&self, id: &str, now: DateTime<Utc>) -> Option<FocusSession> {
        let today = local_date(now, self.offset_minutes);
        for back in 0..=i64::from(self.lookback_days) {
            let date = today - Duration::days(back);
            match self.store.focus_sessions(date).await {
                Ok(sessions) => {
                    if let Some(found) = sessions.into_iter().find(|s| s.id == id) {
                        return Some(found);
                    }
                }
                Err(e) => warn!("could not read sessions for {date}: {e}"),
            }
        }
        None
    }

    /// Mark a session completed in whichever partition holds it. Failures
    /// are logged; the terminal state transition must still go ahead.
    async fn complete_session(&self, id: &str, now: DateTime<Utc>, date_hint: Option<NaiveDate>) {
        let date = match date_hint {
            Some(date) => Some(date),
            None => self
                .find_session(id, now)
                .await
                .map(|s| s.calendar_date),
        };
        let Some(date) = date else {
            warn!("session {id} not found; nothing to complete");
            return;
        };

        let id = id.to_string();
        let result = self
            .store
            .update_focus_sessions(date, move |sessions| {
                if let Some(session) = sessions.iter_mut().find(|s| s.id == id) {
                    session.status = SessionStatus::Completed;
                    session.end_instant = Some(now);
                    let minutes = (now - session.start_instant).num_minutes().max(0) as u32;
                    session.duration_minutes = session.duration_minutes.max(minutes);
                }
            })
            .await;
        if let Err(e) = result {
            error!("failed to complete session: {e}");
        }
    }

    async fn sync_rules_tolerant(&self) {
        if let Err(e) = self.rules.sync().await {
            warn!("rule reconciliation failed: {e}");
        }
    }

    fn spawn_ticker(self: &Arc<Self>) {
        self.cancel_ticker();
        let controller = Arc::clone(self);
        let period = StdDuration::from_secs(self.heartbeat_secs);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                controller.heartbeat_at(Utc::now()).await;
            }
        });
        if let Ok(mut ticker) = self.ticker.lock() {
            *ticker = Some(handle);
        }
    }

    fn cancel_ticker(&self) {
        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }
    }

    fn cached(&self) -> Option<ActiveSession> {
        self.active.lock().map(|a| a.clone()).unwrap_or(None)
    }

    fn take_cached(&self) -> Option<ActiveSession> {
        self.active.lock().map(|mut a| a.take()).unwrap_or(None)
    }

    fn set_cached(&self, value: Option<ActiveSession>) {
        if let Ok(mut active) = self.active.lock() {
            *active = value;
        }
    }
}

impl Drop for FocusController {
    fn drop(&mut self) {
        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{MemoryRuleHost, RuleHost};
    use crate::store::{HostStore, MemoryHostStore};

    struct Fixture {
        host: Arc<MemoryHostStore>,
        rule_host: Arc<MemoryRuleHost>,
        store: Arc<StateStore>,
        controller: Arc<FocusController>,
    }

    async fn fixture_with(user_id: Option<&str>) -> Fixture {
        let host = Arc::new(MemoryHostStore::new());
        let store = Arc::new(
            StateStore::open(Arc::clone(&host) as Arc<dyn HostStore>)
                .await
                .unwrap(),
        );
        let rule_host = Arc::new(MemoryRuleHost::new());
        let rules = Arc::new(RuleSyncEngine::start(
            Arc::clone(&store),
            Arc::clone(&rule_host) as Arc<dyn RuleHost>,
            1_000_000,
            2_000_000,
        ));
        let config = EngineConfig {
            user_id: user_id.map(String::from),
            ..EngineConfig::default()
        };
        let controller = Arc::new(FocusController::new(
            Arc::clone(&store),
            rules,
            &config,
        ));
        Fixture {
            host,
            rule_host,
            store,
            controller,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Some("user-1")).await
    }

    #[tokio::test(start_paused = true)]
    async fn enable_fails_closed_without_user() {
        let fx = fixture_with(None).await;
        let result = fx.controller.enable_at(Utc::now()).await;
        assert!(matches!(
            result,
            Err(CoreError::Validation(ValidationError::MissingUserContext))
        ));
        assert!(!fx.store.state().focus_mode_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn enable_creates_session_and_installs_rules() {
        let fx = fixture().await;
        let now = Utc::now();
        fx.store
            .update_state(|s| {
                s.blocked_domains.insert("reddit.com".into());
            })
            .await
            .unwrap();

        fx.controller.enable_at(now).await.unwrap();

        let state = fx.store.state();
        assert!(state.focus_mode_enabled);
        let id = state.active_session_id.clone().unwrap();
        assert_eq!(state.stats.sessions_today, 1);

        let sessions = fx.store.focus_sessions(local_date(now, 0)).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert_eq!(sessions[0].status, SessionStatus::Active);
        assert_eq!(fx.rule_host.rules().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enable_is_idempotent() {
        let fx = fixture().await;
        let now = Utc::now();
        fx.controller.enable_at(now).await.unwrap();
        let first_id = fx.store.state().active_session_id.clone();

        fx.controller
            .enable_at(now + Duration::minutes(1))
            .await
            .unwrap();
        let state = fx.store.state();
        assert_eq!(state.active_session_id, first_id);
        assert_eq!(state.stats.sessions_today, 1);

        let sessions = fx.store.focus_sessions(local_date(now, 0)).await.unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_completes_session_and_accumulates_focus_time() {
        let fx = fixture().await;
        let start = Utc::now();
        fx.controller.enable_at(start).await.unwrap();

        let end = start + Duration::minutes(25);
        fx.controller.disable_at(end).await.unwrap();

        let state = fx.store.state();
        assert!(!state.focus_mode_enabled);
        assert!(state.active_session_id.is_none());
        assert_eq!(state.stats.total_focus_ms, 25 * 60 * 1000);

        let sessions = fx
            .store
            .focus_sessions(local_date(start, 0))
            .await
            .unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Completed);
        assert_eq!(sessions[0].duration_minutes, 25);
        assert_eq!(sessions[0].end_instant, Some(end));
        assert!(fx.rule_host.rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_widens_duration_monotonically() {
        let fx = fixture().await;
        let start = Utc::now();
        fx.controller.enable_at(start).await.unwrap();

        fx.controller
            .heartbeat_at(start + Duration::minutes(3))
            .await;
        fx.controller
            .heartbeat_at(start + Duration::minutes(1))
            .await;

        let sessions = fx
            .store
            .focus_sessions(local_date(start, 0))
            .await
            .unwrap();
        assert_eq!(sessions[0].duration_minutes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_rebuilds_active_session_after_restart() {
        let fx = fixture().await;
        let start = Utc::now();
        fx.controller.enable_at(start).await.unwrap();
        let id = fx.store.state().active_session_id.clone().unwrap();

        // Simulate a crash: new store and controller over the same host.
        let store = Arc::new(
            StateStore::open(Arc::clone(&fx.host) as Arc<dyn HostStore>)
                .await
                .unwrap(),
        );
        let rule_host = Arc::new(MemoryRuleHost::new());
        let rules = Arc::new(RuleSyncEngine::start(
            Arc::clone(&store),
            Arc::clone(&rule_host) as Arc<dyn RuleHost>,
            1_000_000,
            2_000_000,
        ));
        let config = EngineConfig {
            user_id: Some("user-1".into()),
            ..EngineConfig::default()
        };
        let controller = Arc::new(FocusController::new(Arc::clone(&store), rules, &config));

        let later = start + Duration::minutes(10);
        controller.recover_at(later).await.unwrap();
        assert!(store.state().focus_mode_enabled);

        // Heartbeats resume against the original start instant.
        controller.heartbeat_at(later).await;
        let sessions = store.focus_sessions(local_date(start, 0)).await.unwrap();
        assert_eq!(sessions[0].id, id);
        assert_eq!(sessions[0].duration_minutes, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_finds_session_from_a_multi_day_outage() {
        let fx = fixture().await;
        let start = Utc::now();
        fx.controller.enable_at(start).await.unwrap();
        let id = fx.store.state().active_session_id.clone().unwrap();

        // The machine stays off for three days before the next launch.
        let store = Arc::new(
            StateStore::open(Arc::clone(&fx.host) as Arc<dyn HostStore>)
                .await
                .unwrap(),
        );
        let rule_host = Arc::new(MemoryRuleHost::new());
        let rules = Arc::new(RuleSyncEngine::start(
            Arc::clone(&store),
            Arc::clone(&rule_host) as Arc<dyn RuleHost>,
            1_000_000,
            2_000_000,
        ));
        let config = EngineConfig {
            user_id: Some("user-1".into()),
            ..EngineConfig::default()
        };
        let controller = Arc::new(FocusController::new(Arc::clone(&store), rules, &config));

        let later = start + Duration::days(3);
        controller.recover_at(later).await.unwrap();

        // The original record was found in its own partition, so the
        // first heartbeat widens from the original start instant rather
        // than restarting the clock at recovery time.
        controller.heartbeat_at(later + Duration::minutes(1)).await;
        let sessions = store.focus_sessions(local_date(start, 0)).await.unwrap();
        assert_eq!(sessions[0].id, id);
        assert_eq!(
            sessions[0].duration_minutes,
            (3 * 24 * 60 + 1) as u32
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_is_closed_before_a_new_one_starts() {
        let fx = fixture().await;
        let start = Utc::now();
        fx.controller.enable_at(start).await.unwrap();

        // Crash without recovery: fresh controller sees the stale id.
        let config = EngineConfig {
            user_id: Some("user-1".into()),
            ..EngineConfig::default()
        };
        let rule_host = Arc::new(MemoryRuleHost::new());
        let rules = Arc::new(RuleSyncEngine::start(
            Arc::clone(&fx.store),
            Arc::clone(&rule_host) as Arc<dyn RuleHost>,
            1_000_000,
            2_000_000,
        ));
        let controller = Arc::new(FocusController::new(
            Arc::clone(&fx.store),
            rules,
            &config,
        ));
        // Mirror says enabled but nothing is cached, so this is treated
        // as a fresh enable over a stale session.
        fx.store
            .update_state(|s| s.focus_mode_enabled = false)
            .await
            .unwrap();

        let later = start + Duration::minutes(5);
        controller.enable_at(later).await.unwrap();

        let sessions = fx
            .store
            .focus_sessions(local_date(start, 0))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 2);
        let statuses: Vec<_> = sessions.iter().map(|s| s.status).collect();
        assert!(statuses.contains(&SessionStatus::Completed));
        assert!(statuses.contains(&SessionStatus::Active));
        assert_eq!(
            fx.store.state().active_session_id.as_deref(),
            sessions
                .iter()
                .find(|s| s.status == SessionStatus::Active)
                .map(|s| s.id.as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disable_flips_state_even_when_completion_write_fails() {
        let fx = fixture().await;
        let start = Utc::now();
        fx.controller.enable_at(start).await.unwrap();

        // The completion write exhausts its retries; the state flip that
        // follows must still land.
        fx.host.fail_next_sets(3);
        fx.controller
            .disable_at(start + Duration::minutes(1))
            .await
            .unwrap();
        assert!(!fx.store.state().focus_mode_enabled);
    }
}
