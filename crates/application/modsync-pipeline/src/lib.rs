//! The periodic pipelines (modlist poll, workshop poll, local download,
//! SFTP sync, RCON shutdown) and the orchestrator that composes them into
//! one state machine per managed server.

pub mod download;
pub mod modlist_poll;
pub mod orchestrator;
pub mod rcon_tick;
pub mod sync;
pub mod workshop_poll;

pub use modlist_poll::{ModlistSource, PollError, SftpModlistPoller};
pub use orchestrator::{Dependencies, Orchestrator};
pub use rcon_tick::{RconController, RestartTicker};
pub use sync::{ServerSyncer, SftpSyncEngine, SyncError};

use modsync_persistence::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("operation cancelled")]
    Cancelled,
}
