//! SFTP sync engine: per-(server, mod) three-way tree reconciliation
//! between the canonical local mod copies and each server's remote mods
//! directory.

pub mod engine;
pub mod execute;
pub mod local;

pub use engine::SftpSyncEngine;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use modsync_infra::sftp::SftpError;
use modsync_persistence::{StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Sftp(#[from] SftpError),
    #[error("local tree: {0}")]
    Local(std::io::Error),
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("operation cancelled")]
    Cancelled,
}

/// One mod on a server's work list.
#[derive(Debug, Clone)]
pub struct ModSyncItem {
    pub workshop_id: String,
    pub folder_slug: String,
    /// The payload timestamp this sync will record into `synced_mods`.
    pub local_updated_at: DateTime<Utc>,
}

/// The capability the orchestrator drives after each download cycle.
#[async_trait]
pub trait ServerSyncer: Send + Sync {
    /// Bring every server with a pending mod update in line with the local
    /// mod copies. Per-server failures are recorded in the state document,
    /// not returned; only store access errors surface.
    async fn sync_servers(
        &self,
        cancel: &CancellationToken,
        store: &dyn StateStore,
    ) -> Result<(), SyncError>;
}
