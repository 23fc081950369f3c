//! Activity tracking state machine.
//!
//! Accumulates time-on-domain into per-domain-per-day records from a
//! stream of host events: a periodic tick (nominally every 5s) while a
//! page is focused, tab/domain switches, window focus changes, and
//! explicit flush requests before the host unloads.
//!
//! Accounting rules:
//! - every tick credits the wall-clock gap since the previous tick to the
//!   active domain, so total credited time equals focused time regardless
//!   of tick jitter
//! - a gap longer than the sleep threshold credits nothing; the machine
//!   assumes the device was asleep for the whole gap
//! - a tick that crosses local midnight splits the gap at midnight,
//!   completes the old day's record and opens the new day's
//! - at most one record per date has `currently_active = true`

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use log::{info, warn};

use crate::error::CoreError;
use crate::store::StateStore;
use crate::types::{local_date, DomainDaySession, SessionStatus};

/// The slot being accumulated into: one domain, one date, and the instant
/// time was last credited up to.
#[derive(Debug, Clone)]
struct ActiveSlot {
    domain: String,
    date: NaiveDate,
    last_credit: DateTime<Utc>,
}

/// Diagnostic counters exposed for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerCounters {
    /// A -> B -> A returns within the continuity window (not new visits).
    pub continuity_returns: u64,
    /// Gaps above the sleep threshold that were discarded.
    pub sleep_gaps: u64,
    /// Ticks that crossed local midnight.
    pub day_rollovers: u64,
}

pub struct ActivityTracker {
    store: Arc<StateStore>,
    offset_minutes: i32,
    sleep_threshold: Duration,
    continuity_window: Duration,
    slot: Mutex<Option<ActiveSlot>>,
    /// Domain left most recently and when, for continuity detection.
    previous: Mutex<Option<(String, DateTime<Utc>)>>,
    window_focused: AtomicBool,
    continuity_returns: AtomicU64,
    sleep_gaps: AtomicU64,
    day_rollovers: AtomicU64,
}

impl ActivityTracker {
    pub fn new(
        store: Arc<StateStore>,
        offset_minutes: i32,
        sleep_threshold_secs: u64,
        continuity_window_secs: u64,
    ) -> Self {
        Self {
            store,
            offset_minutes,
            sleep_threshold: Duration::seconds(sleep_threshold_secs as i64),
            continuity_window: Duration::seconds(continuity_window_secs as i64),
            slot: Mutex::new(None),
            previous: Mutex::new(None),
            window_focused: AtomicBool::new(true),
            continuity_returns: AtomicU64::new(0),
            sleep_gaps: AtomicU64::new(0),
            day_rollovers: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> TrackerCounters {
        TrackerCounters {
            continuity_returns: self.continuity_returns.load(Ordering::SeqCst),
            sleep_gaps: self.sleep_gaps.load(Ordering::SeqCst),
            day_rollovers: self.day_rollovers.load(Ordering::SeqCst),
        }
    }

    /// Domain currently being tracked, if any.
    pub fn active_domain(&self) -> Option<String> {
        self.current_slot().map(|s| s.domain)
    }

    /// Periodic tick: credit the gap since the last credit to the active
    /// domain, handling sleep gaps and midnight crossings.
    pub async fn heartbeat_at(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        let Some(slot) = self.current_slot() else {
            return Ok(());
        };
        if !self.window_focused.load(Ordering::SeqCst) {
            // Unfocused time is never credited; keep the cursor fresh so
            // refocusing does not credit the blurred span.
            self.advance_cursor(now);
            return Ok(());
        }

        let gap = now - slot.last_credit;
        if gap <= Duration::zero() {
            return Ok(());
        }

        if gap > self.sleep_threshold {
            self.sleep_gaps.fetch_add(1, Ordering::SeqCst);
            info!(
                "discarding {}s gap for {} (device slept)",
                gap.num_seconds(),
                slot.domain
            );
            return self.resume_after_sleep(&slot, now).await;
        }

        let today = local_date(now, self.offset_minutes);
        if today != slot.date {
            self.day_rollovers.fetch_add(1, Ordering::SeqCst);
            return self.roll_over(&slot, now, today).await;
        }

        self.credit(&slot.domain, slot.date, gap).await?;
        self.advance_cursor(now);
        Ok(())
    }

    /// The user moved to a different domain (tab switch or navigation).
    ///
    /// Credits the outgoing domain up to `now`, deactivates it, and
    /// activates (or creates) today's record for the new domain. Returning
    /// to the domain left within the continuity window counts as the same
    /// visit.
    pub async fn switch_to(&self, domain: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        let today = local_date(now, self.offset_minutes);

        let mut departed = None;
        if let Some(slot) = self.current_slot() {
            if slot.domain == domain && slot.date == today {
                return Ok(());
            }
            self.close_slot(&slot, now, SessionStatus::Completed).await?;
            departed = Some((slot.domain, now));
        }

        // Continuity compares against the domain departed *before* this
        // switch: an A -> B -> A bounce back within the window is one
        // visit to A, not two.
        let is_return = self
            .previous
            .lock()
            .ok()
            .and_then(|p| p.clone())
            .map(|(prev, left_at)| prev == domain && now - left_at <= self.continuity_window)
            .unwrap_or(false);
        if is_return {
            self.continuity_returns.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(departed) = departed {
            if let Ok(mut previous) = self.previous.lock() {
                *previous = Some(departed);
            }
        }

        let offset = self.offset_minutes;
        let target = domain.to_string();
        self.store
            .update_domain_days(today, move |days| {
                for day in days.iter_mut() {
                    day.currently_active = false;
                }
                match days.iter_mut().find(|d| d.domain == target) {
                    Some(existing) => {
                        existing.currently_active = true;
                        existing.status = SessionStatus::Active;
                        // An already-shipped record is accumulating again;
                        // it goes out again with the new total.
                        existing.synced = false;
                        if !is_return {
                            existing.visits += 1;
                        }
                    }
                    None => days.push(DomainDaySession::first_visit(&target, today, offset)),
                }
            })
            .await?;

        self.set_slot(Some(ActiveSlot {
            domain: domain.to_string(),
            date: today,
            last_credit: now,
        }));
        self.window_focused.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The window lost focus: credit up to `now`, then stop crediting.
    pub async fn window_blurred(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        if let Some(slot) = self.current_slot() {
            let gap = (now - slot.last_credit).max(Duration::zero());
            if gap <= self.sleep_threshold {
                self.credit(&slot.domain, slot.date, gap).await?;
            }
            self.advance_cursor(now);
        }
        self.window_focused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// The window regained focus: resume crediting from `now`.
    pub fn window_refocused(&self, now: DateTime<Utc>) {
        self.advance_cursor(now);
        self.window_focused.store(true, Ordering::SeqCst);
    }

    /// Flush accumulated time immediately (host is about to unload or the
    /// device is about to suspend).
    pub async fn save_now(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        let Some(slot) = self.current_slot() else {
            return Ok(());
        };
        if self.window_focused.load(Ordering::SeqCst) {
            let gap = (now - slot.last_credit).max(Duration::zero());
            if gap <= self.sleep_threshold {
                self.credit(&slot.domain, slot.date, gap).await?;
            }
        }
        self.advance_cursor(now);
        Ok(())
    }

    /// Tracking ended (browser closed, user signed out): flush, deactivate
    /// and forget the slot.
    pub async fn stop(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        if let Some(slot) = self.current_slot() {
            self.close_slot(&slot, now, SessionStatus::Completed).await?;
            self.set_slot(None);
        }
        Ok(())
    }

    /// Credit a slot up to `now`, mark it inactive and set its status.
    async fn close_slot(
        &self,
        slot: &ActiveSlot,
        now: DateTime<Utc>,
        status: SessionStatus,
    ) -> Result<(), CoreError> {
        let gap = (now - slot.last_credit).max(Duration::zero());
        let credited = if self.window_focused.load(Ordering::SeqCst) && gap <= self.sleep_threshold
        {
            gap.num_seconds().max(0) as u64
        } else {
            0
        };
        let domain = slot.domain.clone();
        self.store
            .update_domain_days(slot.date, move |days| {
                if let Some(day) = days.iter_mut().find(|d| d.domain == domain) {
                    day.duration_seconds += credited;
                    day.currently_active = false;
                    day.status = status;
                }
            })
            .await?;
        Ok(())
    }

    /// After a sleep gap: the pre-gap span was already credited by earlier
    /// ticks, so the old slot is closed without further credit and a fresh
    /// cursor starts at `now`.
    async fn resume_after_sleep(
        &self,
        slot: &ActiveSlot,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let today = local_date(now, self.offset_minutes);
        let crossed_midnight = today != slot.date;
        let domain = slot.domain.clone();
        self.store
            .update_domain_days(slot.date, move |days| {
                if let Some(day) = days.iter_mut().find(|d| d.domain == domain) {
                    day.currently_active = false;
                    day.status = SessionStatus::Completed;
                }
            })
            .await?;

        // Same domain is still in front of the user; reattach without
        // counting a new visit unless the date changed.
        if crossed_midnight {
            let offset = self.offset_minutes;
            let domain = slot.domain.clone();
            self.store
                .update_domain_days(today, move |days| {
                    for day in days.iter_mut() {
                        day.currently_active = false;
                    }
                    match days.iter_mut().find(|d| d.domain == domain) {
                        Some(existing) => {
                            existing.currently_active = true;
                            existing.status = SessionStatus::Active;
                            existing.synced = false;
                            existing.visits += 1;
                        }
                        None => days.push(DomainDaySession::first_visit(&domain, today, offset)),
                    }
                })
                .await?;
        } else {
            let domain = slot.domain.clone();
            self.store
                .update_domain_days(slot.date, move |days| {
                    if let Some(day) = days.iter_mut().find(|d| d.domain == domain) {
                        day.currently_active = true;
                        day.status = SessionStatus::Active;
                        day.synced = false;
                    }
                })
                .await?;
        }

        self.set_slot(Some(ActiveSlot {
            domain: slot.domain.clone(),
            date: today,
            last_credit: now,
        }));
        Ok(())
    }

    /// A tick crossed local midnight: split the gap at midnight, complete
    /// the old day's record and continue accumulating into the new day's.
    async fn roll_over(
        &self,
        slot: &ActiveSlot,
        now: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<(), CoreError> {
        let midnight = self.local_midnight_utc(today);
        let before = (midnight - slot.last_credit).max(Duration::zero());
        let before_secs = before.num_seconds().max(0) as u64;

        let domain = slot.domain.clone();
        self.store
            .update_domain_days(slot.date, move |days| {
                if let Some(day) = days.iter_mut().find(|d| d.domain == domain) {
                    day.duration_seconds += before_secs;
                    day.currently_active = false;
                    day.status = SessionStatus::Completed;
                }
            })
            .await?;

        let after = (now - midnight).max(Duration::zero());
        let after_secs = after.num_seconds().max(0) as u64;
        let offset = self.offset_minutes;
        let domain = slot.domain.clone();
        self.store
            .update_domain_days(today, move |days| {
                for day in days.iter_mut() {
                    day.currently_active = false;
                }
                match days.iter_mut().find(|d| d.domain == domain) {
                    Some(existing) => {
                        existing.duration_seconds += after_secs;
                        existing.currently_active = true;
                        existing.status = SessionStatus::Active;
                        existing.synced = false;
                    }
                    None => {
                        let mut day = DomainDaySession::first_visit(&domain, today, offset);
                        day.duration_seconds = after_secs;
                        days.push(day);
                    }
                }
            })
            .await?;

        info!(
            "rolled {} over midnight: {before_secs}s to {}, {after_secs}s to {today}",
            slot.domain, slot.date
        );
        self.set_slot(Some(ActiveSlot {
            domain: slot.domain.clone(),
            date: today,
            last_credit: now,
        }));
        Ok(())
    }

    async fn credit(
        &self,
        domain: &str,
        date: NaiveDate,
        gap: Duration,
    ) -> Result<(), CoreError> {
        let seconds = gap.num_seconds().max(0) as u64;
        if seconds == 0 {
            return Ok(());
        }
        let domain = domain.to_string();
        self.store
            .update_domain_days(date, move |days| {
                match days.iter_mut().find(|d| d.domain == domain) {
                    Some(day) => day.duration_seconds += seconds,
                    None => warn!("crediting unknown domain record {domain}"),
                }
            })
            .await?;
        Ok(())
    }

    /// UTC instant of local midnight at the start of `date`.
    fn local_midnight_utc(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_time(NaiveTime::MIN) - Duration::minutes(i64::from(self.offset_minutes));
        DateTime::from_naive_utc_and_offset(naive, Utc)
    }

    fn current_slot(&self) -> Option<ActiveSlot> {
        self.slot.lock().map(|s| s.clone()).unwrap_or(None)
    }

    fn set_slot(&self, value: Option<ActiveSlot>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = value;
        }
    }

    fn advance_cursor(&self, now: DateTime<Utc>) {
        if let Ok(mut slot) = self.slot.lock() {
            if let Some(slot) = slot.as_mut() {
                slot.last_credit = now;
            }
        }
    }
}
