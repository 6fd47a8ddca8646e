//! Module types and data structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Receiver id that addresses every requester when broadcast is enabled.
pub const BROADCAST_UID: i64 = 0;

/// Maximum length of a module name.
pub const MAX_MODULE_NAME_LENGTH: usize = 64;

/// Identity of the caller of an engine operation.
///
/// Resolved upstream; the engine trusts it as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    /// User id of the caller.
    pub user_id: i64,
    /// Whether the caller is the system itself.
    pub is_system: bool,
}

impl Requester {
    /// A regular user.
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            is_system: false,
        }
    }

    /// The privileged system requester (user id 0).
    pub fn system() -> Self {
        Self {
            user_id: 0,
            is_system: true,
        }
    }
}

/// Install request for a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleView {
    /// Module name.
    pub name: String,
    /// Lua source.
    pub code: String,
}

impl ModuleView {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
        }
    }
}

/// Outcome of an install request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    /// Module name.
    pub name: String,
    /// Whether the new code compiled and is now active.
    pub compiled_ok: bool,
    /// Compile error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A message on the module bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMessage {
    /// Log-wide strictly increasing id.
    pub id: i64,
    /// Sending module.
    pub module: String,
    /// User on whose behalf the module sent the message.
    pub sender_uid: i64,
    /// Addressed user, or the broadcast sentinel.
    pub receiver_uid: i64,
    /// Message text.
    pub message: String,
    /// Time the id was assigned.
    #[sqlx(rename = "created_at")]
    pub create_date: DateTime<Utc>,
}

/// Visibility of the broadcast sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastPolicy {
    /// Messages to [`BROADCAST_UID`] are visible to every requester.
    #[default]
    Enabled,
    /// [`BROADCAST_UID`] is an ordinary receiver id.
    Disabled,
}

impl BroadcastPolicy {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }

    /// Whether a message addressed to `receiver_uid` is visible to `requester_uid`.
    pub fn is_visible(&self, receiver_uid: i64, requester_uid: i64) -> bool {
        receiver_uid == requester_uid
            || (*self == Self::Enabled && receiver_uid == BROADCAST_UID)
    }
}

/// Filter for browsing the message log.
#[derive(Debug, Clone, Default)]
pub struct MessageSearch {
    /// Only messages with an id strictly greater than this.
    pub min_id: Option<i64>,
    /// Only messages with an id strictly less than this.
    pub max_id: Option<i64>,
    /// Only messages sent by this module.
    pub module: Option<String>,
    /// Maximum number of results (default 100, capped at 1000).
    pub limit: Option<i64>,
    /// Newest first instead of oldest first.
    pub reverse: bool,
    /// Ignore receiver visibility (honored for system requesters only).
    pub all_receivers: bool,
}

/// Result of recompiling persisted modules at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Modules compiled and activated.
    pub loaded: usize,
    /// Modules whose stored code failed to compile.
    pub failed: Vec<(String, String)>,
}

/// Check that a module name is usable.
pub fn validate_module_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("module name must not be empty".to_string());
    }
    if name.len() > MAX_MODULE_NAME_LENGTH {
        return Err(format!(
            "module name must be at most {MAX_MODULE_NAME_LENGTH} characters"
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(format!(
            "module name '{name}' may only contain letters, digits, '_' and '-'"
        ));
    }
    Ok(())
}
