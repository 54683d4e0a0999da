//! Workshop metadata polling: decide which mods are due for a check, fan
//! the checks out in batches, and stamp the results into the state
//! document through one short update.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use modsync_core::ModMetadata;
use modsync_infra::workshop::{MetadataClient, WorkshopError};
use modsync_persistence::{StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum WorkshopPollError {
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("operation cancelled")]
    Cancelled,
}

pub struct WorkshopPollSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub parallelism: usize,
}

/// One poll cycle. Network I/O runs against a state snapshot; the single
/// `update` at the end stamps check times, applies monotonic upstream
/// timestamps, and computes which mods need a fresh local download. Every
/// checked id is stamped whether or not its batch produced a value, so a
/// failing batch is not re-hammered on the next tick.
///
/// Returns the sorted ids whose local payload is missing or stale.
pub async fn poll_workshop(
    cancel: &CancellationToken,
    store: &dyn StateStore,
    client: &dyn MetadataClient,
    settings: &WorkshopPollSettings,
    now: DateTime<Utc>,
) -> Result<Vec<String>, WorkshopPollError> {
    let snapshot = store.load()?;

    // Candidate set: every mod any server currently declares.
    let candidates: BTreeSet<String> = snapshot
        .servers
        .values()
        .flat_map(|server| server.last_mod_ids.iter().cloned())
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let cutoff = now - settings.poll_interval;
    let due: Vec<String> = candidates
        .iter()
        .filter(|id| {
            snapshot
                .mods
                .get(*id)
                .and_then(|m| m.last_workshop_check_at)
                .map(|checked| checked < cutoff)
                .unwrap_or(true)
        })
        .cloned()
        .collect();

    let fetched = fetch_in_batches(cancel, client, &due, settings).await?;

    let mut needs_update = Vec::new();
    store.update(&mut |state| {
        for id in &due {
            let entry = state.mods.entry(id.clone()).or_default();
            entry.last_workshop_check_at = Some(now);
            if let Some(meta) = fetched.get(id) {
                entry.last_title = Some(meta.title.clone());
                entry.workshop_updated_at = Some(match entry.workshop_updated_at {
                    Some(existing) => existing.max(meta.updated_at),
                    None => meta.updated_at,
                });
            }
        }

        needs_update = candidates
            .iter()
            .filter(|id| match state.mods.get(*id) {
                None => true,
                Some(m) => match (m.local_updated_at, m.workshop_updated_at) {
                    (None, _) => true,
                    (Some(local), Some(upstream)) => upstream > local,
                    (Some(_), None) => false,
                },
            })
            .cloned()
            .collect();
        Ok(())
    })?;

    Ok(needs_update)
}

/// Fan the due ids out in batches. A batch that fails after its retries is
/// reported and dropped; its ids simply yield no value this cycle. Only
/// cancellation aborts the poll.
async fn fetch_in_batches(
    cancel: &CancellationToken,
    client: &dyn MetadataClient,
    due: &[String],
    settings: &WorkshopPollSettings,
) -> Result<HashMap<String, ModMetadata>, WorkshopPollError> {
    if due.is_empty() {
        return Ok(HashMap::new());
    }
    let batch_size = settings.batch_size.max(1);
    let batches: Vec<Vec<String>> = due.chunks(batch_size).map(|c| c.to_vec()).collect();

    let results: Vec<(Vec<String>, Result<HashMap<String, ModMetadata>, WorkshopError>)> =
        futures::stream::iter(batches)
            .map(|batch| async move {
                let result = client.fetch_metadata(cancel, &batch).await;
                (batch, result)
            })
            .buffer_unordered(settings.parallelism.max(1))
            .collect()
            .await;

    let mut merged = HashMap::new();
    for (batch, result) in results {
        match result {
            Ok(map) => merged.extend(map),
            Err(WorkshopError::Cancelled) => return Err(WorkshopPollError::Cancelled),
            Err(e) => {
                warn!(
                    ids = batch.len(),
                    error = %e,
                    "workshop metadata batch failed; its mods go unrefreshed until the next due poll"
                );
            }
        }
    }
    Ok(merged)
}
