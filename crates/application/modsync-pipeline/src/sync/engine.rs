use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use modsync_config::{Config, ServerConfig};
use modsync_core::state_ops::{begin_countdown, mods_to_sync, record_server_error};
use modsync_core::{Clock, Stage, State};
use modsync_infra::sftp::{join_remote, SftpConnector, SftpSession};
use modsync_persistence::StateStore;

use crate::sync::{execute, ModSyncItem, ServerSyncer, SyncError};

/// The production sync engine: one SFTP session per pending server, mods
/// reconciled in bounded parallel, every state change published through a
/// short store update so no I/O ever runs under the store lock.
pub struct SftpSyncEngine {
    config: Arc<Config>,
    connector: Arc<dyn SftpConnector>,
    clock: Arc<dyn Clock>,
}

impl SftpSyncEngine {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn SftpConnector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            connector,
            clock,
        }
    }

    fn grace_period(&self) -> Duration {
        Duration::seconds(self.config.shutdown.grace_period_seconds as i64)
    }

    async fn sync_server(
        &self,
        cancel: &CancellationToken,
        store: &dyn StateStore,
        server: &ServerConfig,
        snapshot: &State,
    ) -> Result<(), SyncError> {
        let server_id = server.id.clone();
        let server_state = snapshot.servers.get(&server_id).cloned().unwrap_or_default();

        let work = match mods_to_sync(&server_state, &snapshot.mods) {
            Ok(work) => work,
            Err(e) => {
                let now = self.clock.now();
                let message = e.to_string();
                store.update(&mut |state| {
                    let srv = state.servers.entry(server_id.clone()).or_default();
                    srv.needs_mod_update = true;
                    record_server_error(srv, "compute_mods_to_sync", message.clone(), now);
                    Ok(())
                })?;
                error!(server_id = %server_id, error = %message, "cannot build sync work list");
                return Ok(());
            }
        };

        if work.is_empty() {
            // Everything declared already matches synced_mods; go straight
            // to the restart countdown.
            let now = self.clock.now();
            let grace = self.grace_period();
            store.update(&mut |state| {
                let srv = state.servers.entry(server_id.clone()).or_default();
                begin_countdown(srv, now, grace);
                Ok(())
            })?;
            info!(server_id = %server_id, "mods already in sync, scheduling restart");
            return Ok(());
        }

        let items: Vec<ModSyncItem> = work
            .iter()
            .filter_map(|id| {
                let mod_state = snapshot.mods.get(id)?;
                Some(ModSyncItem {
                    workshop_id: id.clone(),
                    folder_slug: mod_state.folder_slug.clone(),
                    local_updated_at: mod_state.local_updated_at?,
                })
            })
            .collect();

        store.update(&mut |state| {
            state.servers.entry(server_id.clone()).or_default().stage = Stage::Syncing;
            Ok(())
        })?;

        let session = match self.dial(cancel, server).await {
            Ok(session) => session,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => {
                let now = self.clock.now();
                let message = e.to_string();
                store.update(&mut |state| {
                    let srv = state.servers.entry(server_id.clone()).or_default();
                    srv.needs_mod_update = true;
                    record_server_error(srv, "connect", message.clone(), now);
                    Ok(())
                })?;
                error!(server_id = %server_id, error = %message, "sftp dial failed");
                return Ok(());
            }
        };
        let session = Arc::new(Mutex::new(session));

        let parallelism = self
            .config
            .concurrency
            .sftp_sync_parallelism_mods_per_server
            .max(1);
        let local_mods_root = self.config.paths.local_mods_root.clone();
        let remote_mods_root = server.sftp.remote_mods_root.clone();

        let results: Vec<(ModSyncItem, Result<(), SyncError>)> =
            futures::stream::iter(items.into_iter())
                .map(|item| {
                    let session = session.clone();
                    let cancel = cancel.clone();
                    let local_root = local_mods_root.join(&item.folder_slug);
                    let remote_root = join_remote(&remote_mods_root, &item.folder_slug);
                    async move {
                        let outcome = tokio::task::spawn_blocking(move || {
                            execute::sync_mod_tree(&cancel, &session, &local_root, &remote_root)
                        })
                        .await
                        .unwrap_or_else(|e| Err(SyncError::Local(std::io::Error::other(e))));
                        (item, outcome)
                    }
                })
                .buffer_unordered(parallelism)
                .collect()
                .await;

        let now = self.clock.now();
        let grace = self.grace_period();
        let mut failed = Vec::new();
        store.update(&mut |state| {
            let srv = state.servers.entry(server_id.clone()).or_default();
            failed.clear();
            for (item, outcome) in &results {
                match outcome {
                    Ok(()) => {
                        srv.synced_mods
                            .insert(item.workshop_id.clone(), item.local_updated_at);
                    }
                    Err(e) => {
                        record_server_error(
                            srv,
                            "sync_mod",
                            format!("mod {}: {e}", item.workshop_id),
                            now,
                        );
                        failed.push(item.workshop_id.clone());
                    }
                }
            }
            if failed.is_empty() {
                begin_countdown(srv, now, grace);
                srv.last_success_sync_at = Some(now);
            } else {
                srv.needs_mod_update = true;
                srv.stage = Stage::Error;
            }
            Ok(())
        })?;

        if failed.is_empty() {
            info!(server_id = %server_id, mods = results.len(), "server sync complete");
        } else {
            error!(server_id = %server_id, failed = failed.len(), "server sync had failures");
        }
        Ok(())
    }

    async fn dial(
        &self,
        cancel: &CancellationToken,
        server: &ServerConfig,
    ) -> Result<Box<dyn SftpSession>, SyncError> {
        let connector = self.connector.clone();
        let sftp_config = server.sftp.clone();
        let dial = tokio::task::spawn_blocking(move || connector.connect(&sftp_config));
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = dial => match result {
                Ok(session) => Ok(session?),
                Err(e) => Err(SyncError::Local(std::io::Error::other(e))),
            },
        }
    }
}

#[async_trait]
impl ServerSyncer for SftpSyncEngine {
    async fn sync_servers(
        &self,
        cancel: &CancellationToken,
        store: &dyn StateStore,
    ) -> Result<(), SyncError> {
        let snapshot = store.load()?;
        let pending: Vec<ServerConfig> = self
            .config
            .servers
            .iter()
            .filter(|server| {
                snapshot
                    .servers
                    .get(&server.id)
                    .map(|s| s.needs_mod_update)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let parallelism = self.config.concurrency.sftp_sync_parallelism_servers.max(1);
        let outcomes: Vec<Result<(), SyncError>> = futures::stream::iter(pending.into_iter())
            .map(|server| {
                let snapshot = snapshot.clone();
                async move { self.sync_server(cancel, store, &server, &snapshot).await }
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;

        // Per-server failures were recorded in state; only store access
        // errors propagate to the orchestrator.
        for outcome in outcomes {
            outcome?;
        }
        Ok(())
    }
}
