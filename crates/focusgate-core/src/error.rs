//! Core error types for focusgate-core.
//!
//! One error family per subsystem, collected under [`CoreError`]. The
//! taxonomy mirrors how failures are handled: validation errors are
//! returned synchronously and never retried, store/rule/sync errors are
//! retried with backoff before surfacing, and bookkeeping errors inside
//! background timers are logged rather than propagated.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for focusgate-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Durable state store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Rule synchronization errors
    #[error("Rule sync error: {0}")]
    Rule(#[from] RuleError),

    /// Sync dispatcher errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Errors from the durable state store and its host persistence service.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// A host persistence call failed (transient, retried by the queue)
    #[error("host persistence call failed: {0}")]
    Host(String),

    /// All retry attempts were consumed
    #[error("write failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// A stored blob could not be decoded
    #[error("failed to decode stored record '{key}': {message}")]
    Decode { key: String, message: String },

    /// The write queue worker has shut down
    #[error("state store write queue is closed")]
    Closed,
}

/// Errors from the rule synchronization engine.
///
/// Cloneable because one recomputation result is fanned out to every
/// coalesced caller.
#[derive(Error, Debug, Clone)]
pub enum RuleError {
    /// A host enforcement call (list/install/remove) failed
    #[error("host enforcement call failed: {0}")]
    Host(String),

    /// The rule sync worker has shut down
    #[error("rule sync queue is closed")]
    Closed,
}

/// Errors from the sync dispatcher and its backend.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// The backend rejected or failed to acknowledge a batch
    #[error("sync backend error: {0}")]
    Backend(String),

    /// Reading candidate records from the store failed
    #[error("failed to read pending records: {0}")]
    Read(String),
}

/// Validation errors, returned synchronously and never retried.
#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    /// No user context configured; focus mode fails closed
    #[error("no user context available; cannot start a focus session")]
    MissingUserContext,

    /// A command payload is missing or has an empty domain
    #[error("domain must not be empty")]
    MissingDomain,

    /// An override duration of zero makes no sense
    #[error("override duration must be greater than zero")]
    InvalidOverrideDuration,
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// The data directory could not be resolved or created
    #[error("Failed to prepare data directory: {0}")]
    DataDir(String),
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
