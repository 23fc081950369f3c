//! Command protocol between hosts and the engine.
//!
//! Hosts (browser extension, desktop shell, CLI) drive the engine through
//! a small tagged-JSON message set. Responses always carry `success`; a
//! failed command reports its reason in `error` instead of surfacing a
//! transport failure, so hosts can treat every round trip uniformly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    EnableFocus,
    DisableFocus,
    AddBlockedDomain { domain: String },
    RemoveBlockedDomain { domain: String },
    /// Temporarily exempt a blocked domain for `duration_ms`.
    OverrideDomain { domain: String, duration_ms: u64 },
    GetFocusState,
    GetTodayUsage,
    GetBlockedDomains,
    RecordBlockedAttempt { domain: String },
    SyncNow,
}

/// Outbound response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }

    pub fn ok_with(data: Value) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn err(message: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(message.to_string()),
            data: None,
        }
    }
}
