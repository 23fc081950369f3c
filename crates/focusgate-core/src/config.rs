//! TOML-based engine configuration.
//!
//! Stores the tunables for the state store, session lifecycle, activity
//! tracking and sync dispatcher:
//! - user identity (required before focus mode can be enabled)
//! - heartbeat and tracking tick intervals
//! - idle/sleep gap threshold
//! - sync backend endpoint, batch size and retry ceiling
//! - reserved rule id range
//!
//! Configuration is stored at `~/.config/focusgate/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;

/// Engine configuration.
///
/// Serialized to/from TOML at `~/.config/focusgate/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// User the sessions belong to. Focus mode fails closed without it.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Focus session heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Activity tracking tick interval in seconds (primary accumulator).
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Gap between tracking heartbeats treated as idle/sleep, in seconds.
    #[serde(default = "default_sleep_threshold_secs")]
    pub sleep_threshold_secs: u64,
    /// Window within which an A -> B -> A return counts as continuity
    /// (diagnostic only), in seconds.
    #[serde(default = "default_continuity_window_secs")]
    pub continuity_window_secs: u64,
    /// Records per sync batch.
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: usize,
    /// Automatic sync attempts per record before it needs a manual run.
    #[serde(default = "default_sync_retry_limit")]
    pub sync_retry_limit: u32,
    /// Periodic sync dispatcher interval in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// How many past days the dispatcher scans for unsynced records.
    #[serde(default = "default_sync_lookback_days")]
    pub sync_lookback_days: u32,
    /// Analytics backend endpoint; sync is skipped when unset.
    #[serde(default)]
    pub sync_endpoint: Option<String>,
    /// Fixed UTC offset used to derive local calendar dates.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Inclusive lower bound of the reserved rule id range.
    #[serde(default = "default_rule_id_floor")]
    pub rule_id_floor: u32,
    /// Exclusive upper bound of the reserved rule id range.
    #[serde(default = "default_rule_id_ceiling")]
    pub rule_id_ceiling: u32,
}

fn default_heartbeat_secs() -> u64 {
    60
}
fn default_tick_secs() -> u64 {
    5
}
fn default_sleep_threshold_secs() -> u64 {
    300
}
fn default_continuity_window_secs() -> u64 {
    3
}
fn default_sync_batch_size() -> usize {
    5
}
fn default_sync_retry_limit() -> u32 {
    3
}
fn default_sync_interval_secs() -> u64 {
    600
}
fn default_sync_lookback_days() -> u32 {
    7
}
fn default_rule_id_floor() -> u32 {
    1_000_000
}
fn default_rule_id_ceiling() -> u32 {
    2_000_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            heartbeat_secs: default_heartbeat_secs(),
            tick_secs: default_tick_secs(),
            sleep_threshold_secs: default_sleep_threshold_secs(),
            continuity_window_secs: default_continuity_window_secs(),
            sync_batch_size: default_sync_batch_size(),
            sync_retry_limit: default_sync_retry_limit(),
            sync_interval_secs: default_sync_interval_secs(),
            sync_lookback_days: default_sync_lookback_days(),
            sync_endpoint: None,
            utc_offset_minutes: 0,
            rule_id_floor: default_rule_id_floor(),
            rule_id_ceiling: default_rule_id_ceiling(),
        }
    }
}

impl EngineConfig {
    fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from disk, writing the defaults on first run.
    ///
    /// # Errors
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                path,
                message: e.to_string(),
            }),
            Err(_) => {
                let cfg = Self::default();
                cfg.save()?;
                Ok(cfg)
            }
        }
    }

    /// Persist to disk.
    ///
    /// # Errors
    /// Returns an error if the config cannot be serialized or written.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path()?;
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::SaveFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, content).map_err(|e| ConfigError::SaveFailed {
            path,
            message: e.to_string(),
        })
    }

    /// Load from disk, returning defaults on any error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}

/// Returns `~/.config/focusgate[-dev]/` based on FOCUSGATE_ENV.
///
/// Set FOCUSGATE_ENV=dev to use the development data directory.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("FOCUSGATE_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("focusgate-dev")
    } else {
        base_dir.join("focusgate")
    };

    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::DataDir(e.to_string()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = EngineConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.heartbeat_secs, 60);
        assert_eq!(parsed.tick_secs, 5);
        assert_eq!(parsed.sleep_threshold_secs, 300);
        assert_eq!(parsed.sync_batch_size, 5);
        assert_eq!(parsed.sync_retry_limit, 3);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let parsed: EngineConfig = toml::from_str("user_id = \"u-1\"").unwrap();
        assert_eq!(parsed.user_id.as_deref(), Some("u-1"));
        assert_eq!(parsed.rule_id_floor, 1_000_000);
        assert_eq!(parsed.rule_id_ceiling, 2_000_000);
        assert_eq!(parsed.sync_lookback_days, 7);
    }

    #[test]
    fn reserved_range_is_nonempty_by_default() {
        let cfg = EngineConfig::default();
        assert!(cfg.rule_id_floor < cfg.rule_id_ceiling);
    }
}
