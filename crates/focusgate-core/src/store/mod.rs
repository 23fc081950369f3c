//! Durable state store: a queued, atomic wrapper over the host
//! persistence service.
//!
//! All writes are funneled through a single-worker FIFO queue; a write is
//! a mutator closure applied to the freshest copy of the target record
//! inside the drain loop, so read-modify-write sequences can never
//! interleave. In a cooperative-scheduling model this queue is the
//! substitute for a mutex: every persistence call is a suspension point,
//! and the queue guarantees no two logical writes span it concurrently.
//!
//! Reads are not queued. They retry independently and callers must
//! tolerate snapshot staleness; anything that needs
//! read-modify-write atomicity performs the modify step inside a single
//! queued closure instead.

pub mod host;

pub use host::{HostStore, MemoryHostStore, SqliteHostStore};

use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use crate::backoff::{retry, DEFAULT_ATTEMPTS, DEFAULT_BASE};
use crate::error::StoreError;
use crate::types::{DomainDaySession, FocusSession, PersistedState};

/// Key of the single per-user state blob.
const STATE_KEY: &str = "focusgate/state";

fn focus_sessions_key(date: NaiveDate) -> String {
    format!("focusgate/focus_sessions/{date}")
}

fn domain_days_key(date: NaiveDate) -> String {
    format!("focusgate/domain_days/{date}")
}

type StateMutator = Box<dyn FnOnce(&mut PersistedState) + Send>;
type FocusMutator = Box<dyn FnOnce(&mut Vec<FocusSession>) + Send>;
type DomainMutator = Box<dyn FnOnce(&mut Vec<DomainDaySession>) + Send>;
type Ack = oneshot::Sender<Result<(), StoreError>>;

enum WriteJob {
    State { mutate: StateMutator, ack: Ack },
    FocusSessions {
        date: NaiveDate,
        mutate: FocusMutator,
        ack: Ack,
    },
    DomainDays {
        date: NaiveDate,
        mutate: DomainMutator,
        ack: Ack,
    },
}

/// Queued, atomic view over the host persistence service.
///
/// Holds an in-memory mirror of [`PersistedState`] that is only committed
/// after the corresponding host write succeeded, so the mirror never gets
/// ahead of durable storage.
pub struct StateStore {
    host: Arc<dyn HostStore>,
    mirror: Arc<Mutex<PersistedState>>,
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl StateStore {
    /// Open the store: load (or default) the state blob and start the
    /// single-worker drain task.
    ///
    /// # Errors
    /// Returns an error if the initial state read fails after retries or
    /// the stored blob cannot be decoded.
    pub async fn open(host: Arc<dyn HostStore>) -> Result<Self, StoreError> {
        let initial = match read_with_retry(host.as_ref(), STATE_KEY).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Decode {
                key: STATE_KEY.to_string(),
                message: e.to_string(),
            })?,
            None => PersistedState::default(),
        };

        let mirror = Arc::new(Mutex::new(initial));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(rx, Arc::clone(&host), Arc::clone(&mirror)));

        Ok(Self { host, mirror, tx })
    }

    /// Snapshot of the in-memory mirror.
    pub fn state(&self) -> PersistedState {
        self.mirror
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Queue an atomic read-modify-write of the state blob.
    pub async fn update_state<F>(&self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut PersistedState) + Send + 'static,
    {
        self.enqueue(|ack| WriteJob::State {
            mutate: Box::new(mutate),
            ack,
        })
        .await
    }

    /// Queue an atomic read-modify-write of one date's focus sessions.
    pub async fn update_focus_sessions<F>(
        &self,
        date: NaiveDate,
        mutate: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Vec<FocusSession>) + Send + 'static,
    {
        self.enqueue(|ack| WriteJob::FocusSessions {
            date,
            mutate: Box::new(mutate),
            ack,
        })
        .await
    }

    /// Queue an atomic read-modify-write of one date's domain-day sessions.
    pub async fn update_domain_days<F>(
        &self,
        date: NaiveDate,
        mutate: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Vec<DomainDaySession>) + Send + 'static,
    {
        self.enqueue(|ack| WriteJob::DomainDays {
            date,
            mutate: Box::new(mutate),
            ack,
        })
        .await
    }

    /// Read one date's focus sessions (unqueued, may race queued writes).
    pub async fn focus_sessions(&self, date: NaiveDate) -> Result<Vec<FocusSession>, StoreError> {
        read_partition(self.host.as_ref(), &focus_sessions_key(date)).await
    }

    /// Read one date's domain-day sessions (unqueued, may race queued writes).
    pub async fn domain_days(&self, date: NaiveDate) -> Result<Vec<DomainDaySession>, StoreError> {
        read_partition(self.host.as_ref(), &domain_days_key(date)).await
    }

    async fn enqueue<F>(&self, job: F) -> Result<(), StoreError>
    where
        F: FnOnce(Ack) -> WriteJob,
    {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(job(ack))
            .map_err(|_| StoreError::Closed)?;
        done.await.map_err(|_| StoreError::Closed)?
    }
}

/// Single-worker drain loop: processes one write at a time, in order.
async fn drain(
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
    host: Arc<dyn HostStore>,
    mirror: Arc<Mutex<PersistedState>>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            WriteJob::State { mutate, ack } => {
                let result = apply_state(host.as_ref(), &mirror, mutate).await;
                if let Err(ref e) = result {
                    error!("state write failed: {e}");
                }
                let _ = ack.send(result);
            }
            WriteJob::FocusSessions { date, mutate, ack } => {
                let result =
                    apply_partition(host.as_ref(), &focus_sessions_key(date), mutate).await;
                if let Err(ref e) = result {
                    error!("focus session write for {date} failed: {e}");
                }
                let _ = ack.send(result);
            }
            WriteJob::DomainDays { date, mutate, ack } => {
                let result =
                    apply_partition(host.as_ref(), &domain_days_key(date), mutate).await;
                if let Err(ref e) = result {
                    error!("domain day write for {date} failed: {e}");
                }
                let _ = ack.send(result);
            }
        }
    }
    debug!("state store drain loop stopped");
}

/// Mutate a copy of the mirror, persist it, and only then commit the copy
/// back. A failed host write leaves the mirror (and durable state) as
/// they were, so no write is ever partially applied.
async fn apply_state(
    host: &dyn HostStore,
    mirror: &Mutex<PersistedState>,
    mutate: StateMutator,
) -> Result<(), StoreError> {
    let mut next = match mirror.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    mutate(&mut next);
    next.last_updated = Utc::now();

    let raw = serde_json::to_string(&next).map_err(|e| StoreError::Decode {
        key: STATE_KEY.to_string(),
        message: e.to_string(),
    })?;
    write_with_retry(host, STATE_KEY, raw).await?;

    match mirror.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
    Ok(())
}

async fn apply_partition<T>(
    host: &dyn HostStore,
    key: &str,
    mutate: Box<dyn FnOnce(&mut Vec<T>) + Send>,
) -> Result<(), StoreError>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut records: Vec<T> = match read_with_retry(host, key).await? {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        })?,
        None => Vec::new(),
    };
    mutate(&mut records);

    let raw = serde_json::to_string(&records).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    write_with_retry(host, key, raw).await
}

async fn read_partition<T>(host: &dyn HostStore, key: &str) -> Result<Vec<T>, StoreError>
where
    T: serde::de::DeserializeOwned,
{
    match read_with_retry(host, key).await? {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(Vec::new()),
    }
}

async fn read_with_retry(host: &dyn HostStore, key: &str) -> Result<Option<String>, StoreError> {
    retry(DEFAULT_ATTEMPTS, DEFAULT_BASE, |_| host.get(key))
        .await
        .map_err(|e| StoreError::Exhausted {
            attempts: DEFAULT_ATTEMPTS,
            last: e.to_string(),
        })
}

async fn write_with_retry(
    host: &dyn HostStore,
    key: &str,
    value: String,
) -> Result<(), StoreError> {
    retry(DEFAULT_ATTEMPTS, DEFAULT_BASE, |_| {
        host.set(key, value.clone())
    })
    .await
    .map_err(|e| StoreError::Exhausted {
        attempts: DEFAULT_ATTEMPTS,
        last: e.to_string(),
    })
}
