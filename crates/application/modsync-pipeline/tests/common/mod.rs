#![allow(dead_code)]

//! Shared fakes for pipeline tests: an in-memory remote filesystem behind
//! the SFTP traits, scripted metadata/downloader/RCON fakes, and a pinned
//! clock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use modsync_config::{
    ConcurrencyConfig, Config, IntervalsConfig, PathsConfig, ServerConfig, ServerRconConfig,
    ServerSftpConfig, SftpAuthConfig, SftpAuthType, ShutdownConfig, SteamConfig,
};
use modsync_core::plan::TreeEntry;
use modsync_core::{Clock, ModMetadata};
use modsync_infra::rcon::{RconConnection, RconDialer, RconError};
use modsync_infra::sftp::{SftpConnector, SftpError, SftpSession};
use modsync_infra::steamcmd::{
    DownloadError, DownloadReport, DownloadRequest, FailedDownload, WorkshopDownloader,
};
use modsync_infra::workshop::{MetadataClient, WorkshopError};

pub fn instant(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

/// One-server config rooted in a temp directory.
pub fn test_config(root: &Utf8Path) -> Config {
    Config {
        version: 1,
        state_path: root.join("state.json"),
        paths: PathsConfig {
            local_mods_root: root.join("mods"),
            local_cache_root: root.join("cache"),
            steamcmd_path: Utf8PathBuf::from("/usr/bin/steamcmd"),
            steamcmd_workshop_content_root: root.join("content"),
        },
        steam: SteamConfig {
            login: "u".to_string(),
            password: "p".to_string(),
            workshop_game_id: 221_100,
            web_api_key: None,
            workshop_http_timeout_seconds: 5,
            workshop_max_retries: 1,
            workshop_backoff_millis: 10,
        },
        intervals: IntervalsConfig {
            modlist_poll_seconds: 3600,
            workshop_poll_seconds: 300,
            rcon_tick_seconds: 3600,
            state_flush_seconds: 3600,
        },
        shutdown: ShutdownConfig {
            grace_period_seconds: 120,
            announce_every_seconds: 30,
            message_template: "Restart in {minutes} minutes".to_string(),
            final_message: "Server shutting down now".to_string(),
        },
        concurrency: ConcurrencyConfig {
            modlist_poll_parallelism: 2,
            sftp_sync_parallelism_servers: 2,
            sftp_sync_parallelism_mods_per_server: 2,
            workshop_parallelism: 2,
            workshop_batch_size: 2,
        },
        servers: vec![server_config("s1")],
    }
}

pub fn server_config(id: &str) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        name: format!("Server {id}"),
        sftp: ServerSftpConfig {
            host: "127.0.0.1".to_string(),
            port: 2222,
            user: "sftp".to_string(),
            auth: SftpAuthConfig {
                auth_type: SftpAuthType::Password,
                password: Some("pw".to_string()),
                private_key_path: None,
                passphrase: None,
                host_key_sha256: None,
            },
            remote_modlist_path: "/modlist.html".to_string(),
            remote_mods_root: "/upload/mods".to_string(),
            max_retries: 1,
            backoff_ms: 10,
            operation_timeout_seconds: 5,
        },
        rcon: ServerRconConfig {
            host: "127.0.0.1".to_string(),
            port: 2302,
            password: "secret".to_string(),
        },
    }
}

pub struct FakeClock(Mutex<DateTime<Utc>>);

impl FakeClock {
    pub fn at(secs: i64) -> Arc<Self> {
        Arc::new(Self(Mutex::new(instant(secs))))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// In-memory remote filesystem behind the SFTP traits.

#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub data: Vec<u8>,
    pub mtime: i64,
}

#[derive(Debug, Default)]
pub struct RemoteFs {
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, RemoteFile>,
    /// Any created path containing this substring fails, for failure
    /// injection.
    pub fail_create_containing: Option<String>,
}

impl RemoteFs {
    pub fn shared() -> Arc<Mutex<RemoteFs>> {
        Arc::new(Mutex::new(RemoteFs::default()))
    }

    pub fn put_file(&mut self, path: &str, data: &[u8], mtime: i64) {
        self.files.insert(
            path.to_string(),
            RemoteFile {
                data: data.to_vec(),
                mtime,
            },
        );
        // Ensure parent directories exist.
        let mut prefix = String::new();
        for part in path.trim_start_matches('/').split('/') {
            let next = format!("{prefix}/{part}");
            if next != *path {
                self.dirs.insert(next.clone());
            }
            prefix = next;
        }
        self.dirs.retain(|d| d != path);
    }

    fn exists(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.dirs.contains(path)
            || self.files.contains_key(path)
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
            || self.files.keys().any(|f| f.starts_with(&prefix))
    }
}

pub struct FakeSftpConnector {
    pub fs: Arc<Mutex<RemoteFs>>,
    pub fail_dial: Arc<AtomicBool>,
}

impl FakeSftpConnector {
    pub fn new(fs: Arc<Mutex<RemoteFs>>) -> Arc<Self> {
        Arc::new(Self {
            fs,
            fail_dial: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl SftpConnector for FakeSftpConnector {
    fn connect(&self, _config: &ServerSftpConfig) -> Result<Box<dyn SftpSession>, SftpError> {
        if self.fail_dial.load(Ordering::SeqCst) {
            return Err(SftpError::Dial {
                address: "fake".to_string(),
                reason: "injected dial failure".to_string(),
            });
        }
        Ok(Box::new(FakeSftpSession {
            fs: self.fs.clone(),
        }))
    }
}

pub struct FakeSftpSession {
    fs: Arc<Mutex<RemoteFs>>,
}

fn remote_err(path: &str, reason: &str) -> SftpError {
    SftpError::Remote {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

impl SftpSession for FakeSftpSession {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        let fs = self.fs.lock().unwrap();
        fs.files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| remote_err(path, "no such file"))
    }

    fn walk_tree(&self, root: &str) -> Result<Vec<TreeEntry>, SftpError> {
        let fs = self.fs.lock().unwrap();
        if !fs.exists(root) {
            return Ok(Vec::new());
        }
        let prefix = format!("{}/", root.trim_end_matches('/'));
        let mut entries = Vec::new();
        for dir in &fs.dirs {
            if let Some(rel) = dir.strip_prefix(&prefix) {
                entries.push(TreeEntry::dir(rel));
            }
        }
        for (path, file) in &fs.files {
            if let Some(rel) = path.strip_prefix(&prefix) {
                entries.push(TreeEntry::file(rel, file.data.len() as u64, file.mtime));
            }
        }
        Ok(entries)
    }

    fn mkdir_all(&self, path: &str) -> Result<(), SftpError> {
        let mut fs = self.fs.lock().unwrap();
        let mut prefix = String::new();
        for part in path.trim_start_matches('/').split('/') {
            prefix = format!("{prefix}/{part}");
            if fs.files.contains_key(&prefix) {
                return Err(remote_err(&prefix, "exists and is not a directory"));
            }
            fs.dirs.insert(prefix.clone());
        }
        Ok(())
    }

    fn create(&self, path: &str) -> Result<Box<dyn std::io::Write + Send + '_>, SftpError> {
        let mut fs = self.fs.lock().unwrap();
        if let Some(needle) = &fs.fail_create_containing {
            if path.contains(needle.as_str()) {
                return Err(remote_err(path, "injected create failure"));
            }
        }
        fs.files.insert(
            path.to_string(),
            RemoteFile {
                data: Vec::new(),
                mtime: 0,
            },
        );
        Ok(Box::new(FakeRemoteWriter {
            fs: self.fs.clone(),
            path: path.to_string(),
        }))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let mut fs = self.fs.lock().unwrap();
        let record = fs
            .files
            .remove(from)
            .ok_or_else(|| remote_err(from, "no such file"))?;
        fs.files.insert(to.to_string(), record);
        Ok(())
    }

    fn set_times(&self, path: &str, unix_secs: i64) -> Result<(), SftpError> {
        let mut fs = self.fs.lock().unwrap();
        match fs.files.get_mut(path) {
            Some(file) => {
                file.mtime = unix_secs;
                Ok(())
            }
            None => Err(remote_err(path, "no such file")),
        }
    }

    fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        let mut fs = self.fs.lock().unwrap();
        fs.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| remote_err(path, "no such file"))
    }

    fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        let mut fs = self.fs.lock().unwrap();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let has_children = fs.dirs.iter().any(|d| d.starts_with(&prefix))
            || fs.files.keys().any(|f| f.starts_with(&prefix));
        if has_children {
            return Err(remote_err(path, "directory not empty"));
        }
        if fs.dirs.remove(path) {
            Ok(())
        } else {
            Err(remote_err(path, "no such directory"))
        }
    }
}

struct FakeRemoteWriter {
    fs: Arc<Mutex<RemoteFs>>,
    path: String,
}

impl std::io::Write for FakeRemoteWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut fs = self.fs.lock().unwrap();
        match fs.files.get_mut(&self.path) {
            Some(file) => {
                file.data.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => Err(std::io::Error::other("file vanished")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted collaborators.

pub struct FakeMetadataClient {
    pub responses: HashMap<String, ModMetadata>,
    /// Any batch containing one of these ids fails with a 500.
    pub fail_ids: HashSet<String>,
    pub calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeMetadataClient {
    pub fn new(responses: HashMap<String, ModMetadata>) -> Arc<Self> {
        Self::with_failures(responses, HashSet::new())
    }

    pub fn with_failures(
        responses: HashMap<String, ModMetadata>,
        fail_ids: HashSet<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            responses,
            fail_ids,
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MetadataClient for FakeMetadataClient {
    async fn fetch_metadata(
        &self,
        _cancel: &CancellationToken,
        ids: &[String],
    ) -> Result<HashMap<String, ModMetadata>, WorkshopError> {
        self.calls.lock().unwrap().push(ids.to_vec());
        if ids.iter().any(|id| self.fail_ids.contains(id)) {
            return Err(WorkshopError::Status(500));
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.responses.get(id).map(|m| (id.clone(), m.clone())))
            .collect())
    }
}

pub fn metadata(id: &str, title: &str, updated_secs: i64) -> ModMetadata {
    ModMetadata {
        id: id.to_string(),
        title: title.to_string(),
        updated_at: instant(updated_secs),
    }
}

/// Pretends to be steamcmd: writes a payload file under the mod's slug and
/// reports success for everything not in `fail_ids`.
pub struct FakeDownloader {
    pub local_mods_root: Utf8PathBuf,
    pub fail_ids: HashSet<String>,
    pub invocations: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeDownloader {
    pub fn new(local_mods_root: Utf8PathBuf) -> Arc<Self> {
        Arc::new(Self {
            local_mods_root,
            fail_ids: HashSet::new(),
            invocations: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl WorkshopDownloader for FakeDownloader {
    async fn download(
        &self,
        _cancel: &CancellationToken,
        mods: &[DownloadRequest],
    ) -> Result<DownloadReport, DownloadError> {
        self.invocations
            .lock()
            .unwrap()
            .push(mods.iter().map(|m| m.workshop_id.clone()).collect());
        let mut report = DownloadReport::default();
        for request in mods {
            if self.fail_ids.contains(&request.workshop_id) {
                report.failed.push(FailedDownload {
                    workshop_id: request.workshop_id.clone(),
                    reason: "injected failure".to_string(),
                });
                continue;
            }
            let dir = self.local_mods_root.join(&request.folder_slug);
            std::fs::create_dir_all(dir.as_std_path())?;
            std::fs::write(dir.join("mod.txt").as_std_path(), b"downloaded")?;
            report.succeeded.push(request.workshop_id.clone());
        }
        Ok(report)
    }
}

pub struct FakeRconDialer {
    pub commands: Arc<Mutex<Vec<String>>>,
    pub fail_dial: Arc<AtomicBool>,
}

impl FakeRconDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            fail_dial: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
    }
}

#[async_trait]
impl RconDialer for FakeRconDialer {
    async fn dial(
        &self,
        address: &str,
        _password: &str,
    ) -> Result<Box<dyn RconConnection>, RconError> {
        if self.fail_dial.load(Ordering::SeqCst) {
            return Err(RconError::Dial {
                address: address.to_string(),
                reason: "injected dial failure".to_string(),
            });
        }
        Ok(Box::new(FakeRconConnection {
            commands: self.commands.clone(),
        }))
    }
}

struct FakeRconConnection {
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RconConnection for FakeRconConnection {
    async fn command(&mut self, command: &str) -> Result<String, RconError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(String::new())
    }
}
