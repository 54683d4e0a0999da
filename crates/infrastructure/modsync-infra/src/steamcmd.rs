//! The external workshop downloader: one steamcmd invocation per batch,
//! success detection from the transcript, and the atomic payload swap into
//! the canonical local mods root.

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use modsync_config::{PathsConfig, SteamConfig};

use crate::redact::scrub_secret;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("spawn downloader: {0}")]
    Spawn(std::io::Error),
    #[error("downloader i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation cancelled")]
    Cancelled,
}

/// One mod the caller wants refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub workshop_id: String,
    pub folder_slug: String,
}

#[derive(Debug, Clone)]
pub struct FailedDownload {
    pub workshop_id: String,
    pub reason: String,
}

/// Per-batch outcome. An id appears in `succeeded` only when the transcript
/// carries its success marker, the payload directory exists on disk, and
/// the swap into the local mods root completed.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedDownload>,
}

#[async_trait]
pub trait WorkshopDownloader: Send + Sync {
    async fn download(
        &self,
        cancel: &CancellationToken,
        mods: &[DownloadRequest],
    ) -> Result<DownloadReport, DownloadError>;
}

/// Drives the real steamcmd binary.
pub struct SteamCmdRunner {
    steamcmd_path: Utf8PathBuf,
    content_root: Utf8PathBuf,
    local_mods_root: Utf8PathBuf,
    cache_root: Utf8PathBuf,
    login: String,
    password: String,
    app_id: u32,
}

impl SteamCmdRunner {
    pub fn new(paths: &PathsConfig, steam: &SteamConfig) -> Self {
        Self {
            steamcmd_path: paths.steamcmd_path.clone(),
            content_root: paths.steamcmd_workshop_content_root.clone(),
            local_mods_root: paths.local_mods_root.clone(),
            cache_root: paths.local_cache_root.clone(),
            login: steam.login.clone(),
            password: steam.password.clone(),
            app_id: steam.workshop_game_id,
        }
    }

    fn arguments(&self, mods: &[DownloadRequest]) -> Vec<String> {
        let mut args = vec![
            "+login".to_string(),
            self.login.clone(),
            self.password.clone(),
        ];
        for request in mods {
            args.push("+workshop_download_item".to_string());
            args.push(self.app_id.to_string());
            args.push(request.workshop_id.clone());
        }
        args.push("+quit".to_string());
        args
    }

    fn payload_dir(&self, workshop_id: &str) -> Utf8PathBuf {
        self.content_root
            .join(self.app_id.to_string())
            .join(workshop_id)
    }

    async fn run_process(
        &self,
        cancel: &CancellationToken,
        mods: &[DownloadRequest],
    ) -> Result<String, DownloadError> {
        let mut child = tokio::process::Command::new(self.steamcmd_path.as_std_path())
            .args(self.arguments(mods))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(DownloadError::Spawn)?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(DownloadError::Cancelled);
            }
            result = async {
                let (out, err) = tokio::join!(
                    stdout.read_to_end(&mut out_buf),
                    stderr.read_to_end(&mut err_buf),
                );
                out?;
                err?;
                child.wait().await
            } => result?,
        };

        let mut transcript = String::from_utf8_lossy(&out_buf).into_owned();
        if !err_buf.is_empty() {
            transcript.push_str(&String::from_utf8_lossy(&err_buf));
        }
        let transcript = scrub_secret(&transcript, &self.password);
        self.write_transcript(&transcript).await;

        // steamcmd exits non-zero for reasons unrelated to individual item
        // outcomes; per-mod success is judged solely by the transcript
        // marker plus the payload directory.
        if !status.success() {
            warn!(%status, "downloader exited non-zero, judging mods by transcript");
        }
        Ok(transcript)
    }

    async fn write_transcript(&self, transcript: &str) {
        let log_dir = self.cache_root.join("logs");
        if let Err(e) = tokio::fs::create_dir_all(log_dir.as_std_path()).await {
            warn!(error = %e, "could not create downloader log directory");
            return;
        }
        let log_path = log_dir.join("steamcmd.log");
        if let Err(e) = tokio::fs::write(log_path.as_std_path(), transcript).await {
            warn!(error = %e, "could not write downloader transcript");
        }
    }
}

#[async_trait]
impl WorkshopDownloader for SteamCmdRunner {
    async fn download(
        &self,
        cancel: &CancellationToken,
        mods: &[DownloadRequest],
    ) -> Result<DownloadReport, DownloadError> {
        if mods.is_empty() {
            return Ok(DownloadReport::default());
        }
        info!(mods = mods.len(), "invoking workshop downloader");
        let transcript = self.run_process(cancel, mods).await?;
        let markers = parse_success_by_mod_id(&transcript);

        let mut report = DownloadReport::default();
        for request in mods {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let id = &request.workshop_id;
            if !markers.contains(id.as_str()) {
                report.failed.push(FailedDownload {
                    workshop_id: id.clone(),
                    reason: "no success marker in downloader output".to_string(),
                });
                continue;
            }
            let payload = self.payload_dir(id);
            if !payload.as_std_path().is_dir() {
                report.failed.push(FailedDownload {
                    workshop_id: id.clone(),
                    reason: format!("payload directory {payload} missing"),
                });
                continue;
            }

            let payload_clone = payload.clone();
            let target = self.local_mods_root.join(&request.folder_slug);
            let staging_root = self.cache_root.join("staging");
            let slug = request.folder_slug.clone();
            let mirrored = tokio::task::spawn_blocking(move || {
                mirror_payload(&payload_clone, &target, &staging_root, &slug)
            })
            .await
            .map_err(|e| DownloadError::Io(std::io::Error::other(e)))?;

            match mirrored {
                Ok(()) => report.succeeded.push(id.clone()),
                Err(e) => report.failed.push(FailedDownload {
                    workshop_id: id.clone(),
                    reason: format!("mirror payload: {e}"),
                }),
            }
        }
        Ok(report)
    }
}

fn success_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)success\.\s+downloaded\s+item\s+(\d+)").expect("success marker regex")
    })
}

/// Workshop ids the transcript claims were downloaded. A claim alone is not
/// success; the caller also checks the payload directory.
pub fn parse_success_by_mod_id(transcript: &str) -> HashSet<String> {
    success_re()
        .captures_iter(transcript)
        .map(|c| c[1].to_string())
        .collect()
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Swap the downloaded payload into place: copy into a fresh staging
/// directory, move any existing target aside as a backup, rename the
/// staging copy over the target, then drop the backup. A failed final
/// rename restores the backup.
pub fn mirror_payload(
    source: &Utf8Path,
    target: &Utf8Path,
    staging_root: &Utf8Path,
    slug: &str,
) -> std::io::Result<()> {
    std::fs::create_dir_all(staging_root)?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let staging = staging_root.join(format!("{slug}-{}", unix_nanos()));
    copy_tree(source.as_std_path(), staging.as_std_path())?;

    let backup = if target.as_std_path().exists() {
        let backup = staging_root.join(format!("{slug}-backup-{}", unix_nanos()));
        std::fs::rename(target, &backup)?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(&staging, target) {
        let _ = std::fs::remove_dir_all(&staging);
        if let Some(backup) = backup {
            let _ = std::fs::rename(&backup, target);
        }
        return Err(e);
    }
    if let Some(backup) = backup {
        let _ = std::fs::remove_dir_all(&backup);
    }
    Ok(())
}

/// Recursive copy preserving file mtimes, so the sync planner sees the same
/// timestamps steamcmd produced.
fn copy_tree(source: &std::path::Path, dest: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&out)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &out)?;
            let meta = entry.metadata().map_err(std::io::Error::other)?;
            let mtime = filetime::FileTime::from_last_modification_time(&meta);
            filetime::set_file_mtime(&out, mtime)?;
        }
    }
    Ok(())
}
