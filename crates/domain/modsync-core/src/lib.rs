use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod clock;
pub mod modlist;
pub mod plan;
pub mod state_ops;

pub use clock::{Clock, SystemClock};

/// Current schema version of the persisted state document.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Coarse per-server lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    Planning,
    LocalUpdating,
    Syncing,
    Countdown,
    ShuttingDown,
    Error,
}

/// The single persistent document. Everything the daemon remembers across
/// restarts lives here; it is written atomically as one JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mods: BTreeMap<String, ModState>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerState>,
}

impl State {
    pub fn empty() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            updated_at: None,
            mods: BTreeMap::new(),
            servers: BTreeMap::new(),
        }
    }

    /// Repair holes left by older or hand-edited documents. Missing maps and
    /// an empty stage are already healed by the serde defaults; a zero
    /// version becomes the current one.
    pub fn normalize(&mut self) {
        if self.version == 0 {
            self.version = STATE_SCHEMA_VERSION;
        }
    }
}

/// Per-mod bookkeeping, keyed by workshop id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModState {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub folder_slug: String,
    /// Monotonic non-decreasing upstream update time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workshop_updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_workshop_check_at: Option<DateTime<Utc>>,
    /// When the local payload last reflected `workshop_updated_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_title: Option<String>,
}

/// Per-server bookkeeping, keyed by server id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(default)]
    pub last_mod_ids: Vec<String>,
    #[serde(default)]
    pub last_modset_hash: String,
    #[serde(default)]
    pub needs_mod_update: bool,
    #[serde(default)]
    pub needs_shutdown: bool,
    #[serde(default, deserialize_with = "de_stage")]
    pub stage: Stage,
    /// workshop id -> the `local_updated_at` last mirrored to this server.
    #[serde(default)]
    pub synced_mods: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_deadline_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_announce_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_sync_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_sent_at: Option<DateTime<Utc>>,
}

/// Tolerates the empty string some hand-edited documents carry for the
/// stage field by mapping it to `idle`.
fn de_stage<'de, D>(deserializer: D) -> Result<Stage, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.as_str() {
        "" | "idle" => Ok(Stage::Idle),
        "planning" => Ok(Stage::Planning),
        "local_updating" => Ok(Stage::LocalUpdating),
        "syncing" => Ok(Stage::Syncing),
        "countdown" => Ok(Stage::Countdown),
        "shutting_down" => Ok(Stage::ShuttingDown),
        "error" => Ok(Stage::Error),
        other => Err(serde::de::Error::unknown_variant(
            other,
            &[
                "idle",
                "planning",
                "local_updating",
                "syncing",
                "countdown",
                "shutting_down",
                "error",
            ],
        )),
    }
}

/// One row of the remote HTML manifest, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMod {
    pub display_name: String,
    pub workshop_id: String,
    pub folder_slug: String,
}

/// The outcome of one successful modlist poll for one server.
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub mods: Vec<ParsedMod>,
    /// Workshop ids sorted ascending; the identity of the modset.
    pub sorted_ids: Vec<String>,
    pub modset_hash: String,
    /// Where the raw manifest bytes were cached locally.
    pub cache_path: String,
}

/// Upstream metadata for one workshop item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModMetadata {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}
