//! Per-server modlist polling: fetch the remote HTML manifest over SFTP,
//! cache it locally, and parse it into a [`PollResult`] for the
//! orchestrator to merge.

use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use modsync_config::ServerConfig;
use modsync_core::modlist::{hash_modset, parse_html_modlist};
use modsync_core::PollResult;
use modsync_infra::sftp::{SftpConnector, SftpError};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Sftp(#[from] SftpError),
    #[error("write modlist cache: {0}")]
    Cache(std::io::Error),
    #[error("attempt timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
}

/// The one capability the orchestrator needs from the modlist pipeline.
#[async_trait]
pub trait ModlistSource: Send + Sync {
    async fn poll(
        &self,
        cancel: &CancellationToken,
        server: &ServerConfig,
    ) -> Result<PollResult, PollError>;
}

pub struct SftpModlistPoller {
    connector: Arc<dyn SftpConnector>,
    cache_root: Utf8PathBuf,
}

impl SftpModlistPoller {
    pub fn new(connector: Arc<dyn SftpConnector>, cache_root: Utf8PathBuf) -> Self {
        Self {
            connector,
            cache_root,
        }
    }

    /// One dial-and-read attempt under a single deadline.
    async fn attempt(
        &self,
        cancel: &CancellationToken,
        server: &ServerConfig,
    ) -> Result<Vec<u8>, PollError> {
        let connector = self.connector.clone();
        let sftp_config = server.sftp.clone();
        let manifest_path = server.sftp.remote_modlist_path.clone();
        let fetch = tokio::task::spawn_blocking(move || {
            let session = connector.connect(&sftp_config)?;
            session.read_file(&manifest_path)
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(PollError::Cancelled),
            result = tokio::time::timeout(server.sftp.operation_timeout(), fetch) => {
                match result {
                    Err(_) => Err(PollError::Timeout),
                    Ok(Err(join_err)) => Err(PollError::Cache(std::io::Error::other(join_err))),
                    Ok(Ok(bytes)) => Ok(bytes?),
                }
            }
        }
    }

    async fn cache_manifest(
        &self,
        server_id: &str,
        bytes: &[u8],
    ) -> Result<Utf8PathBuf, PollError> {
        let dir = self.cache_root.join("servers").join(server_id);
        tokio::fs::create_dir_all(dir.as_std_path())
            .await
            .map_err(PollError::Cache)?;
        let path = dir.join("modlist.html");
        tokio::fs::write(path.as_std_path(), bytes)
            .await
            .map_err(PollError::Cache)?;
        Ok(path)
    }
}

#[async_trait]
impl ModlistSource for SftpModlistPoller {
    async fn poll(
        &self,
        cancel: &CancellationToken,
        server: &ServerConfig,
    ) -> Result<PollResult, PollError> {
        let max_retries = server.sftp.max_retries.max(1);
        let mut last_err = PollError::Timeout;
        for attempt in 1..=max_retries {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }
            match self.attempt(cancel, server).await {
                Ok(bytes) => {
                    let cache_path = self.cache_manifest(&server.id, &bytes).await?;
                    return Ok(build_poll_result(
                        &String::from_utf8_lossy(&bytes),
                        &server.id,
                        cache_path.as_str(),
                    ));
                }
                Err(PollError::Cancelled) => return Err(PollError::Cancelled),
                Err(e) => {
                    warn!(
                        server_id = %server.id,
                        attempt,
                        error = %e,
                        "modlist poll attempt failed"
                    );
                    last_err = e;
                    if attempt < max_retries {
                        let sleep = server.sftp.backoff() * attempt;
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(PollError::Cancelled),
                            _ = tokio::time::sleep(sleep) => {}
                        }
                    }
                }
            }
        }
        Err(last_err)
    }
}

/// Parse the manifest text into the poll outcome delivered to the store.
pub fn build_poll_result(html: &str, server_id: &str, cache_path: &str) -> PollResult {
    let mut warn_sink = |message: String| {
        warn!(server_id = %server_id, "{message}");
    };
    let mods = parse_html_modlist(html, &mut warn_sink);

    let mut sorted_ids: Vec<String> = mods.iter().map(|m| m.workshop_id.clone()).collect();
    sorted_ids.sort();
    sorted_ids.dedup();
    let modset_hash = hash_modset(&sorted_ids);

    PollResult {
        mods,
        sorted_ids,
        modset_hash,
        cache_path: cache_path.to_string(),
    }
}
