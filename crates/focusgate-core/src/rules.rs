//! Rule synchronization engine.
//!
//! Recomputes the full set of blocking rules from persisted state and
//! reconciles the host enforcement subsystem against it. All requests go
//! through a second FIFO queue: the worker drains every queued request
//! before recomputing once, so a burst of state changes collapses into a
//! single reconciliation pass and two passes can never interleave.
//!
//! Rule ids are allocated from a reserved numeric range so the engine can
//! identify (and clean up) its own rules without touching anything else
//! the host has installed. An id visible in the host's installed list is
//! never handed out again within the same pass.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::RuleError;
use crate::store::StateStore;
use crate::types::{BlockingRule, InstalledRule};

/// Narrow boundary to the host enforcement subsystem.
#[async_trait]
pub trait RuleHost: Send + Sync {
    /// List every rule currently installed, including ones the engine
    /// does not own.
    async fn installed(&self) -> Result<Vec<InstalledRule>, RuleError>;
    /// Install a batch of rules.
    async fn install(&self, rules: Vec<BlockingRule>) -> Result<(), RuleError>;
    /// Remove rules by id. Unknown ids are ignored.
    async fn remove(&self, ids: Vec<u32>) -> Result<(), RuleError>;
}

/// Result of one reconciliation pass, fanned out to every coalesced caller.
#[derive(Debug, Clone, Default)]
pub struct RuleSyncOutcome {
    /// Domains now enforced by an installed rule.
    pub enforced: Vec<String>,
    /// Rules removed from the host during the pass.
    pub removed: usize,
}

type Waiter = oneshot::Sender<Result<RuleSyncOutcome, RuleError>>;

/// Coalescing reconciler between persisted state and the host's rules.
pub struct RuleSyncEngine {
    tx: mpsc::UnboundedSender<Waiter>,
}

impl RuleSyncEngine {
    /// Start the worker task. `floor..ceiling` is the reserved id range.
    pub fn start(
        store: Arc<StateStore>,
        host: Arc<dyn RuleHost>,
        floor: u32,
        ceiling: u32,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(rx, store, host, floor, ceiling));
        Self { tx }
    }

    /// Request a reconciliation pass and wait for its outcome.
    ///
    /// Concurrent callers may share one pass; each still receives the
    /// outcome of a pass that started after their request was queued.
    pub async fn sync(&self) -> Result<RuleSyncOutcome, RuleError> {
        let (ack, done) = oneshot::channel();
        self.tx.send(ack).map_err(|_| RuleError::Closed)?;
        done.await.map_err(|_| RuleError::Closed)?
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<Waiter>,
    store: Arc<StateStore>,
    host: Arc<dyn RuleHost>,
    floor: u32,
    ceiling: u32,
) {
    while let Some(first) = rx.recv().await {
        let mut waiters = vec![first];
        while let Ok(next) = rx.try_recv() {
            waiters.push(next);
        }
        debug!("rule sync pass serving {} request(s)", waiters.len());
        let result = reconcile(&store, host.as_ref(), floor, ceiling).await;
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
    debug!("rule sync worker stopped");
}

/// One full reconciliation pass: remove every rule the engine owns, then
/// install the set the current state calls for.
async fn reconcile(
    store: &StateStore,
    host: &dyn RuleHost,
    floor: u32,
    ceiling: u32,
) -> Result<RuleSyncOutcome, RuleError> {
    let now = Utc::now();
    let state = store.state();

    let installed = host.installed().await?;
    let live_ids: BTreeSet<u32> = installed.iter().map(|r| r.id).collect();
    let owned: Vec<u32> = installed
        .iter()
        .map(|r| r.id)
        .filter(|id| (floor..ceiling).contains(id))
        .collect();

    let removed = owned.len();
    if !owned.is_empty() {
        host.remove(owned).await?;
    }

    // Expired overrides are evicted lazily, whenever a pass notices them.
    // Eviction failing only delays the next eviction, so it is logged and
    // the pass continues.
    let expired = state.expired_overrides_at(now);
    if !expired.is_empty() {
        let evict = expired.clone();
        if let Err(e) = store
            .update_state(move |s| {
                for domain in &evict {
                    s.temporary_overrides.remove(domain);
                }
            })
            .await
        {
            warn!("failed to evict {} expired override(s): {e}", expired.len());
        }
    }

    if !state.focus_mode_enabled {
        info!("focus mode off; removed {removed} rule(s)");
        return Ok(RuleSyncOutcome {
            enforced: Vec::new(),
            removed,
        });
    }

    let overridden = state.overridden_at(now);
    let enforced: Vec<String> = state
        .blocked_domains
        .iter()
        .filter(|d| !overridden.contains(*d))
        .cloned()
        .collect();

    if enforced.is_empty() {
        info!("no domains to enforce; removed {removed} rule(s)");
        return Ok(RuleSyncOutcome {
            enforced,
            removed,
        });
    }

    let mut rules = Vec::with_capacity(enforced.len());
    let mut next_id = floor;
    for domain in &enforced {
        // Skip ids the host still reports as live, even though the engine
        // just asked for their removal.
        while live_ids.contains(&next_id) {
            next_id += 1;
        }
        if next_id >= ceiling {
            return Err(RuleError::Host(format!(
                "reserved rule id range exhausted at {next_id}"
            )));
        }
        rules.push(BlockingRule::new(next_id, domain));
        next_id += 1;
    }

    host.install(rules).await?;
    info!(
        "installed {} rule(s), removed {removed}",
        enforced.len()
    );
    Ok(RuleSyncOutcome { enforced, removed })
}

/// In-memory rule host for embedding and tests.
#[derive(Default)]
pub struct MemoryRuleHost {
    rules: Mutex<Vec<BlockingRule>>,
    list_calls: AtomicU32,
    list_delay_ms: AtomicU64,
}

impl MemoryRuleHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the currently installed rules.
    pub fn rules(&self) -> Vec<BlockingRule> {
        self.rules
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// How many reconciliation passes have listed the rules.
    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Add latency to `installed` (tests only; widens the coalescing window).
    pub fn set_list_delay_ms(&self, ms: u64) {
        self.list_delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl RuleHost for MemoryRuleHost {
    async fn installed(&self) -> Result<Vec<InstalledRule>, RuleError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let rules = self
            .rules
            .lock()
            .map_err(|e| RuleError::Host(e.to_string()))?;
        Ok(rules
            .iter()
            .map(|r| InstalledRule {
                id: r.id,
                domain: r.domain.clone(),
            })
            .collect())
    }

    async fn install(&self, batch: Vec<BlockingRule>) -> Result<(), RuleError> {
        let mut rules = self
            .rules
            .lock()
            .map_err(|e| RuleError::Host(e.to_string()))?;
        rules.extend(batch);
        Ok(())
    }

    async fn remove(&self, ids: Vec<u32>) -> Result<(), RuleError> {
        let mut rules = self
            .rules
            .lock()
            .map_err(|e| RuleError::Host(e.to_string()))?;
        rules.retain(|r| !ids.contains(&r.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HostStore, MemoryHostStore};
    use chrono::Duration;

    const FLOOR: u32 = 1_000_000;
    const CEILING: u32 = 2_000_000;

    async fn setup() -> (Arc<StateStore>, Arc<MemoryRuleHost>, RuleSyncEngine) {
        let store = Arc::new(
            StateStore::open(Arc::new(MemoryHostStore::new()) as Arc<dyn HostStore>)
                .await
                .unwrap(),
        );
        let host = Arc::new(MemoryRuleHost::new());
        let engine = RuleSyncEngine::start(
            Arc::clone(&store),
            Arc::clone(&host) as Arc<dyn RuleHost>,
            FLOOR,
            CEILING,
        );
        (store, host, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn installs_rules_for_blocked_domains_when_enabled() {
        let (store, host, engine) = setup().await;
        store
            .update_state(|s| {
                s.focus_mode_enabled = true;
                s.blocked_domains.insert("facebook.com".into());
                s.blocked_domains.insert("twitter.com".into());
            })
            .await
            .unwrap();

        let outcome = engine.sync().await.unwrap();
        assert_eq!(outcome.enforced.len(), 2);
        let rules = host.rules();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| (FLOOR..CEILING).contains(&r.id)));
        assert!(rules
            .iter()
            .any(|r| r.url_pattern == "*://*.facebook.com/*"));
    }

    #[tokio::test(start_paused = true)]
    async fn removes_everything_when_disabled() {
        let (store, host, engine) = setup().await;
        store
            .update_state(|s| {
                s.focus_mode_enabled = true;
                s.blocked_domains.insert("reddit.com".into());
            })
            .await
            .unwrap();
        engine.sync().await.unwrap();
        assert_eq!(host.rules().len(), 1);

        store
            .update_state(|s| s.focus_mode_enabled = false)
            .await
            .unwrap();
        let outcome = engine.sync().await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert!(outcome.enforced.is_empty());
        assert!(host.rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unexpired_override_suppresses_the_rule() {
        let (store, host, engine) = setup().await;
        let expiry = Utc::now() + Duration::minutes(10);
        store
            .update_state(move |s| {
                s.focus_mode_enabled = true;
                s.blocked_domains.insert("news.com".into());
                s.blocked_domains.insert("mail.com".into());
                s.temporary_overrides.insert("news.com".into(), expiry);
            })
            .await
            .unwrap();

        let outcome = engine.sync().await.unwrap();
        assert_eq!(outcome.enforced, vec!["mail.com".to_string()]);
        assert_eq!(host.rules().len(), 1);
        assert_eq!(host.rules()[0].domain, "mail.com");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_override_is_enforced_again_and_evicted() {
        let (store, host, engine) = setup().await;
        let expiry = Utc::now() - Duration::minutes(1);
        store
            .update_state(move |s| {
                s.focus_mode_enabled = true;
                s.blocked_domains.insert("news.com".into());
                s.temporary_overrides.insert("news.com".into(), expiry);
            })
            .await
            .unwrap();

        let outcome = engine.sync().await.unwrap();
        assert_eq!(outcome.enforced, vec!["news.com".to_string()]);
        assert_eq!(host.rules().len(), 1);

        // The lazy eviction is a queued write; it lands before the next
        // state read because the queue is FIFO.
        store.update_state(|_| {}).await.unwrap();
        assert!(store.state().temporary_overrides.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_rules_are_left_alone() {
        let (store, host, engine) = setup().await;
        host.install(vec![BlockingRule::new(42, "corp-policy.com")])
            .await
            .unwrap();
        store
            .update_state(|s| {
                s.focus_mode_enabled = true;
                s.blocked_domains.insert("reddit.com".into());
            })
            .await
            .unwrap();

        let outcome = engine.sync().await.unwrap();
        assert_eq!(outcome.removed, 0);
        let rules = host.rules();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().any(|r| r.id == 42));
    }

    #[tokio::test(start_paused = true)]
    async fn live_ids_are_never_reused_within_a_pass() {
        let (store, host, engine) = setup().await;
        // A rule from a previous run sits at the floor id.
        host.install(vec![BlockingRule::new(FLOOR, "stale.com")])
            .await
            .unwrap();
        store
            .update_state(|s| {
                s.focus_mode_enabled = true;
                s.blocked_domains.insert("fresh.com".into());
            })
            .await
            .unwrap();

        engine.sync().await.unwrap();
        let rules = host.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].domain, "fresh.com");
        assert_eq!(rules[0].id, FLOOR + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_sync_is_idempotent_on_the_enforced_set() {
        let (store, host, engine) = setup().await;
        store
            .update_state(|s| {
                s.focus_mode_enabled = true;
                s.blocked_domains.insert("a.com".into());
                s.blocked_domains.insert("b.com".into());
            })
            .await
            .unwrap();

        let first = engine.sync().await.unwrap();
        let second = engine.sync().await.unwrap();
        assert_eq!(first.enforced, second.enforced);
        assert_eq!(host.rules().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_coalesce() {
        let (store, host, engine) = setup().await;
        store
            .update_state(|s| {
                s.focus_mode_enabled = true;
                s.blocked_domains.insert("a.com".into());
            })
            .await
            .unwrap();
        host.set_list_delay_ms(10);

        let engine = Arc::new(engine);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move { engine.sync().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        // Requests queued during the first pass share the second one.
        assert!(host.list_calls() <= 2, "got {} passes", host.list_calls());
    }
}
