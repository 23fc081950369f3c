//! Engine assembly.
//!
//! Wires the store, rule engine, session controller, activity tracker and
//! sync dispatcher together, recovers persisted state on startup, and
//! exposes the command protocol as the single entry point for hosts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::commands::{Command, CommandResponse};
use crate::config::EngineConfig;
use crate::dispatch::{SyncBackend, SyncDispatcher, SyncScope};
use crate::error::{CoreError, ValidationError};
use crate::rules::{RuleHost, RuleSyncEngine};
use crate::session::FocusController;
use crate::store::{HostStore, StateStore};
use crate::tracking::ActivityTracker;
use crate::types::local_date;

pub struct Engine {
    config: EngineConfig,
    store: Arc<StateStore>,
    rules: Arc<RuleSyncEngine>,
    controller: Arc<FocusController>,
    tracker: Arc<ActivityTracker>,
    dispatcher: Arc<SyncDispatcher>,
    override_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    sync_ticker: Mutex<Option<JoinHandle<()>>>,
    tracking_ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Assemble the engine, recover persisted state, re-arm override
    /// expiry timers and start the periodic sync pass.
    pub async fn start(
        config: EngineConfig,
        host: Arc<dyn HostStore>,
        rule_host: Arc<dyn RuleHost>,
        backend: Arc<dyn SyncBackend>,
    ) -> Result<Arc<Self>, CoreError> {
        let store = Arc::new(StateStore::open(host).await?);
        let rules = Arc::new(RuleSyncEngine::start(
            Arc::clone(&store),
            rule_host,
            config.rule_id_floor,
            config.rule_id_ceiling,
        ));
        let controller = Arc::new(FocusController::new(
            Arc::clone(&store),
            Arc::clone(&rules),
            &config,
        ));
        let tracker = Arc::new(ActivityTracker::new(
            Arc::clone(&store),
            config.utc_offset_minutes,
            config.sleep_threshold_secs,
            config.continuity_window_secs,
        ));
        let dispatcher = Arc::new(SyncDispatcher::new(
            Arc::clone(&store),
            backend,
            config.sync_batch_size,
            config.sync_retry_limit,
            config.sync_lookback_days,
            config.utc_offset_minutes,
        ));

        let engine = Arc::new(Self {
            config,
            store,
            rules,
            controller,
            tracker,
            dispatcher,
            override_timers: Mutex::new(HashMap::new()),
            sync_ticker: Mutex::new(None),
            tracking_ticker: Mutex::new(None),
        });

        engine.controller.recover().await?;
        engine.rearm_override_timers();
        engine.spawn_sync_ticker();
        engine.spawn_tracking_ticker();
        info!("engine started");
        Ok(engine)
    }

    /// Handle one host command. Never fails at the transport level;
    /// command errors come back inside the response envelope.
    pub async fn handle(self: &Arc<Self>, command: Command) -> CommandResponse {
        match command {
            Command::EnableFocus => match self.controller.enable().await {
                Ok(()) => CommandResponse::ok(),
                Err(e) => CommandResponse::err(e),
            },
            Command::DisableFocus => match self.controller.disable().await {
                Ok(()) => {
                    // Ship the just-completed session in the background.
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = engine.dispatcher.run(SyncScope::Automatic).await {
                            warn!("post-disable sync failed: {e}");
                        }
                    });
                    CommandResponse::ok()
                }
                Err(e) => CommandResponse::err(e),
            },
            Command::AddBlockedDomain { domain } => self.add_blocked_domain(domain).await,
            Command::RemoveBlockedDomain { domain } => self.remove_blocked_domain(domain).await,
            Command::OverrideDomain {
                domain,
                duration_ms,
            } => self.override_domain(domain, duration_ms).await,
            Command::GetFocusState => self.focus_state(),
            Command::GetTodayUsage => self.today_usage().await,
            Command::GetBlockedDomains => self.blocked_domains(),
            Command::RecordBlockedAttempt { domain } => self.record_blocked_attempt(domain).await,
            Command::SyncNow => match self.dispatcher.run(SyncScope::Manual).await {
                Ok(report) => CommandResponse::ok_with(json!({
                    "synced": report.synced,
                    "failed": report.failed,
                    "skipped": report.skipped,
                })),
                Err(e) => CommandResponse::err(e),
            },
        }
    }

    /// Activity event entry points for hosts that report page focus.
    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    pub fn controller(&self) -> &Arc<FocusController> {
        &self.controller
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    async fn add_blocked_domain(self: &Arc<Self>, domain: String) -> CommandResponse {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return CommandResponse::err(ValidationError::MissingDomain);
        }
        let inserted = domain.clone();
        if let Err(e) = self
            .store
            .update_state(move |s| {
                s.blocked_domains.insert(inserted);
            })
            .await
        {
            return CommandResponse::err(e);
        }
        self.sync_rules_tolerant().await;
        CommandResponse::ok()
    }

    async fn remove_blocked_domain(self: &Arc<Self>, domain: String) -> CommandResponse {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return CommandResponse::err(ValidationError::MissingDomain);
        }
        self.cancel_override_timer(&domain);
        let removed = domain.clone();
        if let Err(e) = self
            .store
            .update_state(move |s| {
                s.blocked_domains.remove(&removed);
                s.temporary_overrides.remove(&removed);
            })
            .await
        {
            return CommandResponse::err(e);
        }
        self.sync_rules_tolerant().await;
        CommandResponse::ok()
    }

    async fn override_domain(self: &Arc<Self>, domain: String, duration_ms: u64) -> CommandResponse {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return CommandResponse::err(ValidationError::MissingDomain);
        }
        if duration_ms == 0 {
            return CommandResponse::err(ValidationError::InvalidOverrideDuration);
        }
        let expiry = Utc::now() + Duration::milliseconds(duration_ms as i64);
        let target = domain.clone();
        if let Err(e) = self
            .store
            .update_state(move |s| {
                s.temporary_overrides.insert(target, expiry);
            })
            .await
        {
            return CommandResponse::err(e);
        }
        self.sync_rules_tolerant().await;
        self.arm_override_timer(domain.clone(), expiry);
        CommandResponse::ok_with(json!({ "domain": domain, "expiresAt": expiry }))
    }

    fn focus_state(&self) -> CommandResponse {
        let state = self.store.state();
        let counters = self.tracker.counters();
        CommandResponse::ok_with(json!({
            "focusModeEnabled": state.focus_mode_enabled,
            "activeSessionId": state.active_session_id,
            "blockedDomainCount": state.blocked_domains.len(),
            "activeDomain": self.tracker.active_domain(),
            "sleepGaps": counters.sleep_gaps,
            "dayRollovers": counters.day_rollovers,
            "continuityReturns": counters.continuity_returns,
        }))
    }

    async fn today_usage(&self) -> CommandResponse {
        let now = Utc::now();
        let today = local_date(now, self.config.utc_offset_minutes);
        let state = self.store.state();

        // Daily counters are presented as zero once the date has advanced,
        // without waiting for the next write to roll them.
        let mut stats = state.stats.clone();
        stats.roll_to(today);

        let days = match self.store.domain_days(today).await {
            Ok(days) => days,
            Err(e) => return CommandResponse::err(e),
        };
        let domains: Vec<_> = days
            .iter()
            .map(|d| {
                json!({
                    "domain": d.domain,
                    "durationSeconds": d.duration_seconds,
                    "visits": d.visits,
                    "currentlyActive": d.currently_active,
                })
            })
            .collect();

        CommandResponse::ok_with(json!({
            "date": today,
            "totalFocusMs": stats.total_focus_ms,
            "sessionsToday": stats.sessions_today,
            "blockedAttemptsToday": stats.blocked_attempts_today,
            "domains": domains,
        }))
    }

    fn blocked_domains(&self) -> CommandResponse {
        let state = self.store.state();
        let overridden = state.overridden_at(Utc::now());
        CommandResponse::ok_with(json!({
            "blockedDomains": state.blocked_domains,
            "overridden": overridden,
        }))
    }

    async fn record_blocked_attempt(&self, domain: String) -> CommandResponse {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return CommandResponse::err(ValidationError::MissingDomain);
        }
        let today = local_date(Utc::now(), self.config.utc_offset_minutes);
        info!("blocked attempt on {domain}");
        match self
            .store
            .update_state(move |s| {
                s.stats.roll_to(today);
                s.stats.blocked_attempts_today += 1;
            })
            .await
        {
            Ok(()) => CommandResponse::ok(),
            Err(e) => CommandResponse::err(e),
        }
    }

    async fn sync_rules_tolerant(&self) {
        if let Err(e) = self.rules.sync().await {
            warn!("rule reconciliation failed: {e}");
        }
    }

    /// Arm a timer that drops the override (and re-installs the rule) at
    /// `expiry`. Re-overriding a domain replaces its timer.
    fn arm_override_timer(self: &Arc<Self>, domain: String, expiry: DateTime<Utc>) {
        let wait = (expiry - Utc::now())
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        let engine = Arc::clone(self);
        let timer_domain = domain.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let evicted = timer_domain.clone();
            let result = engine
                .store
                .update_state(move |s| {
                    // A newer override may have replaced this one; only the
                    // expiry this timer was armed for is evicted.
                    if s.temporary_overrides.get(&evicted) == Some(&expiry) {
                        s.temporary_overrides.remove(&evicted);
                    }
                })
                .await;
            if let Err(e) = result {
                warn!("override eviction for {timer_domain} failed: {e}");
            }
            engine.sync_rules_tolerant().await;
        });

        if let Ok(mut timers) = self.override_timers.lock() {
            if let Some(old) = timers.insert(domain, handle) {
                old.abort();
            }
        }
    }

    fn cancel_override_timer(&self, domain: &str) {
        if let Ok(mut timers) = self.override_timers.lock() {
            if let Some(handle) = timers.remove(domain) {
                handle.abort();
            }
        }
    }

    /// After a restart, every unexpired override gets its expiry timer
    /// back; expired ones are left for the next rule pass to evict.
    fn rearm_override_timers(self: &Arc<Self>) {
        let now = Utc::now();
        for (domain, expiry) in self.store.state().temporary_overrides {
            if expiry > now {
                self.arm_override_timer(domain, expiry);
            }
        }
    }

    fn spawn_sync_ticker(self: &Arc<Self>) {
        let period = StdDuration::from_secs(self.config.sync_interval_secs);
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if let Err(e) = engine.dispatcher.run(SyncScope::Automatic).await {
                    warn!("periodic sync failed: {e}");
                }
            }
        });
        if let Ok(mut ticker) = self.sync_ticker.lock() {
            *ticker = Some(handle);
        }
    }

    /// The primary accumulation tick: while a domain slot is active, each
    /// tick credits the elapsed gap (hosts that report their own ticks can
    /// call `tracker().heartbeat_at` directly instead).
    fn spawn_tracking_ticker(self: &Arc<Self>) {
        let period = StdDuration::from_secs(self.config.tick_secs);
        let tracker = Arc::clone(&self.tracker);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if let Err(e) = tracker.heartbeat_at(Utc::now()).await {
                    warn!("tracking tick failed: {e}");
                }
            }
        });
        if let Ok(mut ticker) = self.tracking_ticker.lock() {
            *ticker = Some(handle);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.override_timers.lock() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
        if let Ok(mut ticker) = self.sync_ticker.lock() {
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }
        if let Ok(mut ticker) = self.tracking_ticker.lock() {
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemorySyncBackend;
    use crate::rules::MemoryRuleHost;
    use crate::store::MemoryHostStore;

    async fn engine() -> (Arc<MemoryRuleHost>, Arc<Engine>) {
        let rule_host = Arc::new(MemoryRuleHost::new());
        let engine = Engine::start(
            EngineConfig {
                user_id: Some("user-1".into()),
                ..EngineConfig::default()
            },
            Arc::new(MemoryHostStore::new()),
            Arc::clone(&rule_host) as Arc<dyn RuleHost>,
            Arc::new(MemorySyncBackend::new()),
        )
        .await
        .unwrap();
        (rule_host, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn add_domain_then_enable_installs_rules() {
        let (rule_host, engine) = engine().await;
        let response = engine
            .handle(Command::AddBlockedDomain {
                domain: "Reddit.COM ".into(),
            })
            .await;
        assert!(response.success);

        let response = engine.handle(Command::EnableFocus).await;
        assert!(response.success);
        let rules = rule_host.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].domain, "reddit.com");
    }

    #[tokio::test(start_paused = true)]
    async fn override_suppresses_rule_until_expiry() {
        let (rule_host, engine) = engine().await;
        engine
            .handle(Command::AddBlockedDomain {
                domain: "news.com".into(),
            })
            .await;
        engine.handle(Command::EnableFocus).await;
        assert_eq!(rule_host.rules().len(), 1);

        let response = engine
            .handle(Command::OverrideDomain {
                domain: "news.com".into(),
                duration_ms: 60_000,
            })
            .await;
        assert!(response.success);
        assert!(rule_host.rules().is_empty());

        // Paused clock: advancing past the expiry fires the timer, which
        // evicts the override and reinstalls the rule.
        tokio::time::sleep(StdDuration::from_secs(61)).await;
        // Let the timer's eviction and rule pass drain.
        tokio::time::sleep(StdDuration::from_millis(1)).await;
        assert_eq!(rule_host.rules().len(), 1);
        assert!(engine.store.state().temporary_overrides.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_override_is_rejected() {
        let (_, engine) = engine().await;
        let response = engine
            .handle(Command::OverrideDomain {
                domain: "news.com".into(),
                duration_ms: 0,
            })
            .await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("greater than zero"));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_attempt_increments_daily_counter() {
        let (_, engine) = engine().await;
        engine
            .handle(Command::RecordBlockedAttempt {
                domain: "reddit.com".into(),
            })
            .await;
        engine
            .handle(Command::RecordBlockedAttempt {
                domain: "reddit.com".into(),
            })
            .await;

        let response = engine.handle(Command::GetTodayUsage).await;
        let data = response.data.unwrap();
        assert_eq!(data.pointer("/blockedAttemptsToday").unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_domain_is_rejected_everywhere() {
        let (_, engine) = engine().await;
        for command in [
            Command::AddBlockedDomain { domain: "  ".into() },
            Command::RemoveBlockedDomain { domain: "".into() },
            Command::RecordBlockedAttempt { domain: " ".into() },
            Command::OverrideDomain {
                domain: "".into(),
                duration_ms: 1000,
            },
        ] {
            let response = engine.handle(command).await;
            assert!(!response.success);
        }
    }
}
