//! Local download cycle: hand a batch of stale mods to the external
//! downloader and publish the refreshed payload timestamps.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use modsync_core::modlist::slugify_folder;
use modsync_core::state_ops::apply_download_success;
use modsync_core::Stage;
use modsync_infra::steamcmd::{DownloadError, DownloadReport, DownloadRequest, WorkshopDownloader};
use modsync_persistence::{StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DownloadCycleError {
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Downloader(#[from] DownloadError),
}

/// Run the downloader for `ids` and stamp every success into the state
/// document. Callers serialize invocations through the orchestrator's
/// downloader mutex.
pub async fn run_download_cycle(
    cancel: &CancellationToken,
    store: &dyn StateStore,
    downloader: &dyn WorkshopDownloader,
    ids: &[String],
    now: DateTime<Utc>,
) -> Result<DownloadReport, DownloadCycleError> {
    if ids.is_empty() {
        return Ok(DownloadReport::default());
    }

    // Resolve slugs and flag affected servers as locally updating.
    let mut requests = Vec::with_capacity(ids.len());
    store.update(&mut |state| {
        requests.clear();
        for id in ids {
            let slug = state
                .mods
                .get(id)
                .map(|m| m.folder_slug.clone())
                .filter(|slug| !slug.is_empty())
                .unwrap_or_else(|| slugify_folder("", id));
            requests.push(DownloadRequest {
                workshop_id: id.clone(),
                folder_slug: slug,
            });
        }
        for server in state.servers.values_mut() {
            if server.last_mod_ids.iter().any(|id| ids.contains(id)) {
                server.stage = Stage::LocalUpdating;
            }
        }
        Ok(())
    })?;

    let report = downloader.download(cancel, &requests).await?;

    store.update(&mut |state| {
        for id in &report.succeeded {
            apply_download_success(state, id, now);
        }
        Ok(())
    })?;

    for failure in &report.failed {
        warn!(
            workshop_id = %failure.workshop_id,
            reason = %failure.reason,
            "mod download failed; will retry next workshop poll"
        );
    }
    info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "download cycle finished"
    );
    Ok(report)
}
