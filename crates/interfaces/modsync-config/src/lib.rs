//! Daemon configuration: the JSON file model, defaults, and validation.
//! Loading is fatal-on-error; everything downstream receives an already
//! validated [`Config`].

mod sample;

pub use sample::sample;

use std::collections::HashSet;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

pub const DEFAULT_WORKSHOP_GAME_ID: u32 = 221_100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "defaults::version")]
    pub version: u32,
    #[serde(default = "defaults::state_path")]
    pub state_path: Utf8PathBuf,
    pub paths: PathsConfig,
    pub steam: SteamConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    pub shutdown: ShutdownConfig,
    pub concurrency: ConcurrencyConfig,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub local_mods_root: Utf8PathBuf,
    pub local_cache_root: Utf8PathBuf,
    pub steamcmd_path: Utf8PathBuf,
    pub steamcmd_workshop_content_root: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteamConfig {
    pub login: String,
    pub password: String,
    #[serde(default = "defaults::workshop_game_id")]
    pub workshop_game_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_api_key: Option<String>,
    #[serde(default = "defaults::workshop_http_timeout_seconds")]
    pub workshop_http_timeout_seconds: u64,
    #[serde(default = "defaults::workshop_max_retries")]
    pub workshop_max_retries: u32,
    #[serde(default = "defaults::workshop_backoff_millis")]
    pub workshop_backoff_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalsConfig {
    #[serde(default = "defaults::modlist_poll_seconds")]
    pub modlist_poll_seconds: u64,
    #[serde(default = "defaults::workshop_poll_seconds")]
    pub workshop_poll_seconds: u64,
    #[serde(default = "defaults::rcon_tick_seconds")]
    pub rcon_tick_seconds: u64,
    #[serde(default = "defaults::state_flush_seconds")]
    pub state_flush_seconds: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            modlist_poll_seconds: defaults::modlist_poll_seconds(),
            workshop_poll_seconds: defaults::workshop_poll_seconds(),
            rcon_tick_seconds: defaults::rcon_tick_seconds(),
            state_flush_seconds: defaults::state_flush_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    pub grace_period_seconds: u64,
    pub announce_every_seconds: u64,
    /// `{minutes}` is replaced with the remaining whole minutes.
    pub message_template: String,
    pub final_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub modlist_poll_parallelism: usize,
    pub sftp_sync_parallelism_servers: usize,
    pub sftp_sync_parallelism_mods_per_server: usize,
    pub workshop_parallelism: usize,
    pub workshop_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub sftp: ServerSftpConfig,
    pub rcon: ServerRconConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSftpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SftpAuthConfig,
    #[serde(default = "defaults::remote_modlist_path")]
    pub remote_modlist_path: String,
    pub remote_mods_root: String,
    #[serde(default = "defaults::sftp_max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::sftp_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "defaults::sftp_operation_timeout_seconds")]
    pub operation_timeout_seconds: u64,
}

impl ServerSftpConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SftpAuthType {
    Password,
    PrivateKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpAuthConfig {
    #[serde(rename = "type")]
    pub auth_type: SftpAuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Optional hex SHA-256 host key pin. Absent means any host key is
    /// accepted, which is the (insecure) historical default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRconConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

mod defaults {
    use camino::Utf8PathBuf;

    pub fn version() -> u32 {
        1
    }
    pub fn state_path() -> Utf8PathBuf {
        Utf8PathBuf::from("state.json")
    }
    pub fn workshop_game_id() -> u32 {
        super::DEFAULT_WORKSHOP_GAME_ID
    }
    pub fn workshop_http_timeout_seconds() -> u64 {
        20
    }
    pub fn workshop_max_retries() -> u32 {
        3
    }
    pub fn workshop_backoff_millis() -> u64 {
        500
    }
    pub fn modlist_poll_seconds() -> u64 {
        60
    }
    pub fn workshop_poll_seconds() -> u64 {
        300
    }
    pub fn rcon_tick_seconds() -> u64 {
        5
    }
    pub fn state_flush_seconds() -> u64 {
        15
    }
    pub fn remote_modlist_path() -> String {
        "/modlist.html".to_string()
    }
    pub fn sftp_max_retries() -> u32 {
        3
    }
    pub fn sftp_backoff_ms() -> u64 {
        500
    }
    pub fn sftp_operation_timeout_seconds() -> u64 {
        30
    }
}

/// Load, default-fill, and validate a config file.
pub fn load(path: &camino::Utf8Path) -> Result<Config, ConfigError> {
    let bytes = std::fs::read(path)?;
    let config: Config = serde_json::from_slice(&bytes)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let paths = &self.paths;
        if paths.local_mods_root.as_str().is_empty()
            || paths.local_cache_root.as_str().is_empty()
            || paths.steamcmd_path.as_str().is_empty()
            || paths.steamcmd_workshop_content_root.as_str().is_empty()
        {
            return Err(invalid(
                "paths.local_mods_root, paths.local_cache_root, paths.steamcmd_path, and \
                 paths.steamcmd_workshop_content_root are required",
            ));
        }
        if self.steam.login.is_empty() || self.steam.password.is_empty() {
            return Err(invalid("steam.login and steam.password are required"));
        }
        let shutdown = &self.shutdown;
        if shutdown.grace_period_seconds == 0
            || shutdown.announce_every_seconds == 0
            || shutdown.message_template.is_empty()
            || shutdown.final_message.is_empty()
        {
            return Err(invalid(
                "shutdown.grace_period_seconds, shutdown.announce_every_seconds, \
                 shutdown.message_template, and shutdown.final_message are required",
            ));
        }
        let conc = &self.concurrency;
        if conc.modlist_poll_parallelism == 0
            || conc.sftp_sync_parallelism_servers == 0
            || conc.sftp_sync_parallelism_mods_per_server == 0
            || conc.workshop_parallelism == 0
            || conc.workshop_batch_size == 0
        {
            return Err(invalid("all concurrency fields must be greater than zero"));
        }
        if self.servers.is_empty() {
            return Err(invalid("at least one server is required"));
        }

        let mut seen = HashSet::new();
        for (i, server) in self.servers.iter().enumerate() {
            if server.id.is_empty() || server.name.is_empty() {
                return Err(invalid(format!(
                    "servers[{i}].id and servers[{i}].name are required"
                )));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(invalid(format!(
                    "servers[{i}].id {:?} is duplicated",
                    server.id
                )));
            }
            let sftp = &server.sftp;
            if sftp.host.is_empty()
                || sftp.port == 0
                || sftp.user.is_empty()
                || sftp.remote_modlist_path.is_empty()
                || sftp.remote_mods_root.is_empty()
            {
                return Err(invalid(format!(
                    "servers[{i}].sftp host/port/user/remote_modlist_path/remote_mods_root \
                     are required"
                )));
            }
            validate_auth(i, &sftp.auth)?;
            let rcon = &server.rcon;
            if rcon.host.is_empty() || rcon.port == 0 || rcon.password.is_empty() {
                return Err(invalid(format!(
                    "servers[{i}].rcon host/port/password are required"
                )));
            }
        }
        Ok(())
    }
}

fn validate_auth(i: usize, auth: &SftpAuthConfig) -> Result<(), ConfigError> {
    match auth.auth_type {
        SftpAuthType::Password => {
            if auth.password.as_deref().unwrap_or_default().is_empty() {
                return Err(invalid(format!(
                    "servers[{i}].sftp.auth.password is required when auth.type=password"
                )));
            }
        }
        SftpAuthType::PrivateKey => {
            if auth
                .private_key_path
                .as_ref()
                .map(|p| p.as_str().is_empty())
                .unwrap_or(true)
            {
                return Err(invalid(format!(
                    "servers[{i}].sftp.auth.private_key_path is required when \
                     auth.type=private_key"
                )));
            }
        }
    }
    Ok(())
}
