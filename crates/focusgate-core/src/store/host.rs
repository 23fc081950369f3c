//! Host persistence adapters.
//!
//! The engine never talks to storage directly; everything goes through
//! the narrow [`HostStore`] key/value trait. Two adapters ship with the
//! crate: a SQLite-backed store for stand-alone use and an in-memory
//! store (with failure injection) for embedding and tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::config::data_dir;
use crate::error::StoreError;

/// Narrow boundary to the host persistence service.
///
/// Values are opaque strings (JSON blobs); keys are namespaced by the
/// caller. Implementations only need per-call atomicity -- cross-call
/// ordering is the state store's job.
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
}

/// SQLite-backed host store (single `kv` table).
pub struct SqliteHostStore {
    conn: Mutex<Connection>,
}

impl SqliteHostStore {
    /// Open the store at `~/.config/focusgate/focusgate.db`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_default() -> Result<Self, StoreError> {
        let path = data_dir()
            .map_err(|e| StoreError::Host(e.to_string()))?
            .join("focusgate.db");
        Self::open(&path)
    }

    /// Open the store at an explicit path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Host(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Host(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|e| StoreError::Host(e.to_string()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Host(format!("connection lock poisoned: {e}")))
    }
}

#[async_trait]
impl HostStore for SqliteHostStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT value FROM kv WHERE key = ?1")
            .map_err(|e| StoreError::Host(e.to_string()))?;
        match stmt.query_row(params![key], |row| row.get::<_, String>(0)) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Host(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|e| StoreError::Host(e.to_string()))?;
        Ok(())
    }
}

/// In-memory host store for embedding and tests.
///
/// `fail_next_*` inject transient failures to exercise the retry paths.
#[derive(Default)]
pub struct MemoryHostStore {
    data: Mutex<HashMap<String, String>>,
    fail_next_gets: AtomicU32,
    fail_next_sets: AtomicU32,
}

impl MemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `get` calls fail with a transient error.
    pub fn fail_next_gets(&self, n: u32) {
        self.fail_next_gets.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `set` calls fail with a transient error.
    pub fn fail_next_sets(&self, n: u32) {
        self.fail_next_sets.store(n, Ordering::SeqCst);
    }

    /// Snapshot of every stored key (diagnostics/tests).
    pub fn keys(&self) -> Vec<String> {
        self.data
            .lock()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if Self::take_failure(&self.fail_next_gets) {
            return Err(StoreError::Host("injected get failure".to_string()));
        }
        let data = self
            .data
            .lock()
            .map_err(|e| StoreError::Host(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        if Self::take_failure(&self.fail_next_sets) {
            return Err(StoreError::Host("injected set failure".to_string()));
        }
        let mut data = self
            .data
            .lock()
            .map_err(|e| StoreError::Host(e.to_string()))?;
        data.insert(key.to_string(), value);
        Ok(())
    }
}
