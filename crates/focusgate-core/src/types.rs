//! Persisted data model.
//!
//! Three record shapes cross the host persistence boundary:
//! - [`PersistedState`]: one namespaced blob per user, read/written atomically
//! - [`FocusSession`]: deep-focus session records, partitioned by calendar date
//! - [`DomainDaySession`]: per-domain-per-day usage, partitioned by calendar date
//!
//! [`BlockingRule`] is derived, never persisted: the rule sync engine
//! recomputes the full rule set from state on every pass.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session status shared by focus sessions and domain-day sessions.
///
/// There is no intermediate state: a session is either accumulating or
/// terminal. Completed records are never mutated again except for the
/// `synced` / `retry_count` bookkeeping owned by the sync dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

/// Daily counters kept inside [`PersistedState`].
///
/// `stats_date` records which local date the daily counters belong to so
/// they can be reset on the first write of a new day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_focus_ms: u64,
    pub sessions_today: u32,
    pub blocked_attempts_today: u32,
    pub stats_date: NaiveDate,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self {
            total_focus_ms: 0,
            sessions_today: 0,
            blocked_attempts_today: 0,
            stats_date: Utc::now().date_naive(),
        }
    }
}

impl UsageStats {
    /// Reset daily counters when the calendar date has advanced.
    pub fn roll_to(&mut self, today: NaiveDate) {
        if self.stats_date != today {
            self.stats_date = today;
            self.sessions_today = 0;
            self.blocked_attempts_today = 0;
        }
    }
}

/// The single logical state record, read and written atomically through
/// the state store's write queue.
///
/// Invariant: `active_session_id` is non-null only while
/// `focus_mode_enabled` is true, and references at most one active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub focus_mode_enabled: bool,
    pub blocked_domains: BTreeSet<String>,
    /// domain -> expiry instant; unexpired entries suppress that domain's rule
    pub temporary_overrides: BTreeMap<String, DateTime<Utc>>,
    pub active_session_id: Option<String>,
    pub stats: UsageStats,
    pub last_updated: DateTime<Utc>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            focus_mode_enabled: false,
            blocked_domains: BTreeSet::new(),
            temporary_overrides: BTreeMap::new(),
            active_session_id: None,
            stats: UsageStats::default(),
            last_updated: Utc::now(),
        }
    }
}

impl PersistedState {
    /// Domains currently exempt from blocking: override present and unexpired.
    pub fn overridden_at(&self, now: DateTime<Utc>) -> BTreeSet<String> {
        self.temporary_overrides
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(domain, _)| domain.clone())
            .collect()
    }

    /// Domains whose override has already expired (candidates for lazy eviction).
    pub fn expired_overrides_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.temporary_overrides
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(domain, _)| domain.clone())
            .collect()
    }
}

/// One timed deep-focus interval.
///
/// Owned exclusively by the session lifecycle manager; the sync dispatcher
/// only reads completed records and flips `synced` / `retry_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusSession {
    pub id: String,
    pub user_id: String,
    pub start_instant: DateTime<Utc>,
    pub timezone: String,
    /// Local date the session started on; partition key.
    pub calendar_date: NaiveDate,
    /// Monotonically non-decreasing while active.
    pub duration_minutes: u32,
    pub status: SessionStatus,
    pub end_instant: Option<DateTime<Utc>>,
    pub synced: bool,
    #[serde(default)]
    pub retry_count: u32,
}

impl FocusSession {
    /// Derive a new active session for `user_id` starting now.
    ///
    /// Ids combine the creation instant and user id (unique per user per
    /// instant), with a uuid suffix to disambiguate same-millisecond starts.
    pub fn begin(user_id: &str, now: DateTime<Utc>, offset_minutes: i32) -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}-{}-{}", now.timestamp_millis(), user_id, &uuid[..8]),
            user_id: user_id.to_string(),
            start_instant: now,
            timezone: offset_label(offset_minutes),
            calendar_date: local_date(now, offset_minutes),
            duration_minutes: 0,
            status: SessionStatus::Active,
            end_instant: None,
            synced: false,
            retry_count: 0,
        }
    }
}

/// Accumulated time-on-domain for one calendar date.
///
/// Keyed by `(domain, calendar_date)`. For a given date at most one record
/// has `currently_active = true`, across all domains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainDaySession {
    pub domain: String,
    pub calendar_date: NaiveDate,
    pub duration_seconds: u64,
    pub visits: u32,
    pub currently_active: bool,
    pub status: SessionStatus,
    pub timezone: String,
    pub synced: bool,
    #[serde(default)]
    pub retry_count: u32,
}

impl DomainDaySession {
    pub fn first_visit(domain: &str, date: NaiveDate, offset_minutes: i32) -> Self {
        Self {
            domain: domain.to_string(),
            calendar_date: date,
            duration_seconds: 0,
            visits: 1,
            currently_active: true,
            status: SessionStatus::Active,
            timezone: offset_label(offset_minutes),
            synced: false,
            retry_count: 0,
        }
    }
}

/// A derived enforcement rule: block `domain` while focus mode is on and
/// no unexpired override exists.
///
/// Ids are drawn from the engine's reserved numeric range and are never
/// reused while still visible in the host's installed rule list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingRule {
    pub id: u32,
    pub domain: String,
    /// Main-frame URL filter the host should match.
    pub url_pattern: String,
    /// Block page the host should redirect matches to.
    pub redirect: String,
}

impl BlockingRule {
    pub fn new(id: u32, domain: &str) -> Self {
        Self {
            id,
            domain: domain.to_string(),
            url_pattern: format!("*://*.{domain}/*"),
            redirect: format!("focusgate://blocked?domain={domain}"),
        }
    }
}

/// A rule as reported installed by the host enforcement subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledRule {
    pub id: u32,
    pub domain: String,
}

/// Local calendar date for `now` under a fixed UTC offset.
pub fn local_date(now: DateTime<Utc>, offset_minutes: i32) -> NaiveDate {
    (now + Duration::minutes(i64::from(offset_minutes))).date_naive()
}

/// Human-readable label for a fixed UTC offset, e.g. `UTC+02:00`.
pub fn offset_label(offset_minutes: i32) -> String {
    let sign = if offset_minutes < 0 { '-' } else { '+' };
    let abs = offset_minutes.unsigned_abs();
    format!("UTC{sign}{:02}:{:02}", abs / 60, abs % 60)
}
