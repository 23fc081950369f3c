//! # Focusgate Core Library
//!
//! This library provides the core business logic for Focusgate: timed
//! deep-focus sessions that block distracting domains, and per-domain
//! per-day usage tracking. It implements a CLI-first philosophy where all
//! operations are available via a standalone CLI binary, with host shells
//! (browser extension bridge, desktop app) being thin layers over the same
//! core library.
//!
//! ## Architecture
//!
//! - **State Store**: a single-worker FIFO write queue over a narrow
//!   key/value host boundary; writes are atomic read-modify-write closures
//! - **Rule Sync**: a coalescing reconciler that recomputes the blocking
//!   rule set from state and installs it through the host
//! - **Session Lifecycle**: enable/disable transitions, a 60s heartbeat
//!   and crash recovery for deep-focus sessions
//! - **Activity Tracking**: a tick-driven accumulator with sleep-gap and
//!   midnight-crossing handling
//! - **Sync Dispatcher**: batched, at-least-once shipping of completed
//!   records to an analytics backend
//!
//! ## Key Components
//!
//! - [`Engine`]: assembled engine behind the command protocol
//! - [`StateStore`]: durable state with queued atomic writes
//! - [`FocusController`]: focus session lifecycle manager
//! - [`ActivityTracker`]: per-domain time accumulation
//! - [`EngineConfig`]: application configuration management

pub mod backoff;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod rules;
pub mod session;
pub mod store;
pub mod tracking;
pub mod types;

pub use commands::{Command, CommandResponse};
pub use config::EngineConfig;
pub use dispatch::{
    HttpSyncBackend, MemorySyncBackend, SyncBackend, SyncDispatcher, SyncRecord, SyncReport,
    SyncScope,
};
pub use engine::Engine;
pub use error::{
    ConfigError, CoreError, Result, RuleError, StoreError, SyncError, ValidationError,
};
pub use rules::{MemoryRuleHost, RuleHost, RuleSyncEngine, RuleSyncOutcome};
pub use session::FocusController;
pub use store::{HostStore, MemoryHostStore, SqliteHostStore, StateStore};
pub use tracking::{ActivityTracker, TrackerCounters};
pub use types::{
    BlockingRule, DomainDaySession, FocusSession, InstalledRule, PersistedState, SessionStatus,
    UsageStats,
};
