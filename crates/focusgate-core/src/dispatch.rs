//! Sync dispatcher.
//!
//! Ships completed, unsynced session records to the analytics backend in
//! small batches with at-least-once semantics: a record is only marked
//! `synced` after the backend acknowledged the batch containing it, so a
//! crash between upload and mark re-sends the record on the next pass.
//!
//! Automatic passes give up on a record once its `retry_count` reaches the
//! ceiling; a manual pass (user-initiated) ignores the ceiling and tries
//! everything again.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::store::StateStore;
use crate::types::{local_date, DomainDaySession, FocusSession, SessionStatus};

/// What triggered the pass; controls the retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    /// Periodic or event-driven; respects the retry ceiling.
    Automatic,
    /// User-initiated; retries records past the ceiling too.
    Manual,
}

/// One record on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SyncRecord {
    FocusSession(FocusSession),
    DomainDay(DomainDaySession),
}

/// Outcome of one dispatcher pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    /// True when another pass was already in flight and this one did nothing.
    pub skipped: bool,
}

/// Boundary to the analytics backend.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn upload(&self, batch: &[SyncRecord]) -> Result<(), SyncError>;
}

/// HTTP backend: POSTs each batch as a JSON array.
pub struct HttpSyncBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSyncBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SyncBackend for HttpSyncBackend {
    async fn upload(&self, batch: &[SyncRecord]) -> Result<(), SyncError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(batch)
            .send()
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::Backend(format!(
                "backend returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// In-memory backend for embedding and tests.
#[derive(Default)]
pub struct MemorySyncBackend {
    received: std::sync::Mutex<Vec<SyncRecord>>,
    upload_calls: AtomicU32,
    fail_next: AtomicU32,
}

impl MemorySyncBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<SyncRecord> {
        self.received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn upload_calls(&self) -> u32 {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` uploads fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncBackend for MemorySyncBackend {
    async fn upload(&self, batch: &[SyncRecord]) -> Result<(), SyncError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SyncError::Backend("injected upload failure".to_string()));
        }
        let mut received = self
            .received
            .lock()
            .map_err(|e| SyncError::Backend(e.to_string()))?;
        received.extend_from_slice(batch);
        Ok(())
    }
}

pub struct SyncDispatcher {
    store: Arc<StateStore>,
    backend: Arc<dyn SyncBackend>,
    batch_size: usize,
    retry_limit: u32,
    lookback_days: u32,
    offset_minutes: i32,
    in_flight: AtomicBool,
}

impl SyncDispatcher {
    pub fn new(
        store: Arc<StateStore>,
        backend: Arc<dyn SyncBackend>,
        batch_size: usize,
        retry_limit: u32,
        lookback_days: u32,
        offset_minutes: i32,
    ) -> Self {
        Self {
            store,
            backend,
            batch_size: batch_size.max(1),
            retry_limit,
            lookback_days,
            offset_minutes,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run one pass over the lookback window.
    pub async fn run(&self, scope: SyncScope) -> Result<SyncReport, SyncError> {
        self.run_at(Utc::now(), scope).await
    }

    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        scope: SyncScope,
    ) -> Result<SyncReport, SyncError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync pass already in flight; skipping");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }
        let result = self.run_inner(now, scope).await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(
        &self,
        now: DateTime<Utc>,
        scope: SyncScope,
    ) -> Result<SyncReport, SyncError> {
        let today = local_date(now, self.offset_minutes);
        let mut report = SyncReport::default();

        for days_back in 0..=self.lookback_days {
            let date = today - Duration::days(i64::from(days_back));
            self.sync_focus_sessions(date, scope, &mut report).await?;
            self.sync_domain_days(date, scope, &mut report).await?;
        }

        if report.synced > 0 || report.failed > 0 {
            info!("sync pass: {} shipped, {} failed", report.synced, report.failed);
        }
        Ok(report)
    }

    async fn sync_focus_sessions(
        &self,
        date: NaiveDate,
        scope: SyncScope,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let sessions = self
            .store
            .focus_sessions(date)
            .await
            .map_err(|e| SyncError::Read(e.to_string()))?;
        let pending: Vec<FocusSession> = sessions
            .into_iter()
            .filter(|s| {
                s.status == SessionStatus::Completed
                    && !s.synced
                    && s.duration_minutes > 0
                    && self.within_retry_budget(s.retry_count, scope)
            })
            .collect();

        for chunk in pending.chunks(self.batch_size) {
            let batch: Vec<SyncRecord> = chunk
                .iter()
                .cloned()
                .map(SyncRecord::FocusSession)
                .collect();
            let ids: Vec<String> = chunk.iter().map(|s| s.id.clone()).collect();
            match self.backend.upload(&batch).await {
                Ok(()) => {
                    report.synced += chunk.len();
                    let result = self
                        .store
                        .update_focus_sessions(date, move |sessions| {
                            for session in sessions.iter_mut() {
                                if ids.contains(&session.id) {
                                    session.synced = true;
                                }
                            }
                        })
                        .await;
                    // An unmarked acked record is re-sent next pass, which
                    // at-least-once delivery allows.
                    if let Err(e) = result {
                        warn!("could not mark {} session(s) synced: {e}", chunk.len());
                    }
                }
                Err(e) => {
                    warn!("focus session batch failed: {e}");
                    report.failed += chunk.len();
                    let result = self
                        .store
                        .update_focus_sessions(date, move |sessions| {
                            for session in sessions.iter_mut() {
                                if ids.contains(&session.id) {
                                    session.retry_count += 1;
                                }
                            }
                        })
                        .await;
                    if let Err(e) = result {
                        warn!("could not bump session retry counts: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn sync_domain_days(
        &self,
        date: NaiveDate,
        scope: SyncScope,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let days = self
            .store
            .domain_days(date)
            .await
            .map_err(|e| SyncError::Read(e.to_string()))?;
        let pending: Vec<DomainDaySession> = days
            .into_iter()
            .filter(|d| {
                d.status == SessionStatus::Completed
                    && !d.synced
                    && d.duration_seconds > 0
                    && self.within_retry_budget(d.retry_count, scope)
            })
            .collect();

        for chunk in pending.chunks(self.batch_size) {
            let batch: Vec<SyncRecord> =
                chunk.iter().cloned().map(SyncRecord::DomainDay).collect();
            let domains: Vec<String> = chunk.iter().map(|d| d.domain.clone()).collect();
            match self.backend.upload(&batch).await {
                Ok(()) => {
                    report.synced += chunk.len();
                    let result = self
                        .store
                        .update_domain_days(date, move |days| {
                            for day in days.iter_mut() {
                                if domains.contains(&day.domain) {
                                    day.synced = true;
                                }
                            }
                        })
                        .await;
                    if let Err(e) = result {
                        warn!("could not mark {} day record(s) synced: {e}", chunk.len());
                    }
                }
                Err(e) => {
                    warn!("domain day batch failed: {e}");
                    report.failed += chunk.len();
                    let result = self
                        .store
                        .update_domain_days(date, move |days| {
                            for day in days.iter_mut() {
                                if domains.contains(&day.domain) {
                                    day.retry_count += 1;
                                }
                            }
                        })
                        .await;
                    if let Err(e) = result {
                        warn!("could not bump day retry counts: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    fn within_retry_budget(&self, retry_count: u32, scope: SyncScope) -> bool {
        match scope {
            SyncScope::Automatic => retry_count < self.retry_limit,
            SyncScope::Manual => true,
        }
    }
}
