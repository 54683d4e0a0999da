//! Pure mutations of the state document shared by the pipelines. Every
//! function here runs inside the store's `update` critical section and must
//! not perform I/O.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::{ModState, ServerState, Stage, State};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkListError {
    #[error("mod {0} is referenced by the server but unknown to the state document")]
    UnknownMod(String),
    #[error("mod {0} has no local payload yet")]
    NeverDownloaded(String),
}

/// Workshop ids the server still needs mirrored: every declared id whose
/// local payload timestamp differs from what was last synced to this
/// server. A declared id with no usable local payload is a hard error.
pub fn mods_to_sync(server: &ServerState, mods: &std::collections::BTreeMap<String, ModState>) -> Result<Vec<String>, WorkListError> {
    let mut out = Vec::new();
    for id in &server.last_mod_ids {
        let mod_state = mods
            .get(id)
            .ok_or_else(|| WorkListError::UnknownMod(id.clone()))?;
        let local = mod_state
            .local_updated_at
            .ok_or_else(|| WorkListError::NeverDownloaded(id.clone()))?;
        if server.synced_mods.get(id) != Some(&local) {
            out.push(id.clone());
        }
    }
    Ok(out)
}

/// Flag every server that declares `workshop_id` for a fresh sync pass.
pub fn mark_servers_using_mod_for_planning(state: &mut State, workshop_id: &str) {
    for server in state.servers.values_mut() {
        if server.last_mod_ids.iter().any(|id| id == workshop_id) {
            server.needs_mod_update = true;
            server.stage = Stage::Planning;
        }
    }
}

/// Record a refreshed local payload: the local timestamp now mirrors the
/// upstream one (or "now" when upstream never reported one), and every
/// server using the mod is re-armed.
pub fn apply_download_success(state: &mut State, workshop_id: &str, now: DateTime<Utc>) {
    if let Some(mod_state) = state.mods.get_mut(workshop_id) {
        mod_state.local_updated_at = Some(mod_state.workshop_updated_at.unwrap_or(now));
    }
    mark_servers_using_mod_for_planning(state, workshop_id);
}

/// Sync finished (or there was nothing to mirror): hand the server to the
/// restart countdown.
pub fn begin_countdown(server: &mut ServerState, now: DateTime<Utc>, grace: Duration) {
    server.needs_mod_update = false;
    server.needs_shutdown = true;
    server.stage = Stage::Countdown;
    server.shutdown_deadline_at = Some(now + grace);
    server.next_announce_at = Some(now);
}

/// Stamp a per-server failure. The needs-* flags are left alone so the next
/// cycle retries; only the diagnostics and the stage change.
pub fn record_server_error(
    server: &mut ServerState,
    stage_label: &str,
    message: String,
    now: DateTime<Utc>,
) {
    server.stage = Stage::Error;
    server.last_error = Some(message);
    server.last_error_stage = Some(stage_label.to_string());
    server.last_error_at = Some(now);
}
