use camino::Utf8PathBuf;

use crate::{
    ConcurrencyConfig, Config, IntervalsConfig, PathsConfig, ServerConfig, ServerRconConfig,
    ServerSftpConfig, ShutdownConfig, SftpAuthConfig, SftpAuthType, SteamConfig,
    DEFAULT_WORKSHOP_GAME_ID,
};

/// A fully-populated config with every knob at its default, ready to be
/// printed and edited.
pub fn sample() -> Config {
    Config {
        version: 1,
        state_path: Utf8PathBuf::from("state.json"),
        paths: PathsConfig {
            local_mods_root: Utf8PathBuf::from("./mods"),
            local_cache_root: Utf8PathBuf::from("./cache"),
            steamcmd_path: Utf8PathBuf::from("/usr/bin/steamcmd"),
            steamcmd_workshop_content_root: Utf8PathBuf::from(
                "/home/steam/Steam/steamapps/workshop/content",
            ),
        },
        steam: SteamConfig {
            login: "steam_user".to_string(),
            password: "steam_password".to_string(),
            workshop_game_id: DEFAULT_WORKSHOP_GAME_ID,
            web_api_key: Some("YOUR_STEAM_WEB_API_KEY".to_string()),
            workshop_http_timeout_seconds: 20,
            workshop_max_retries: 3,
            workshop_backoff_millis: 500,
        },
        intervals: IntervalsConfig::default(),
        shutdown: ShutdownConfig {
            grace_period_seconds: 300,
            announce_every_seconds: 60,
            message_template: "Server restart for mod updates in {minutes} minutes".to_string(),
            final_message: "Server restarting now".to_string(),
        },
        concurrency: ConcurrencyConfig {
            modlist_poll_parallelism: 2,
            sftp_sync_parallelism_servers: 2,
            sftp_sync_parallelism_mods_per_server: 2,
            workshop_parallelism: 2,
            workshop_batch_size: 50,
        },
        servers: vec![ServerConfig {
            id: "server-1".to_string(),
            name: "Main Server".to_string(),
            sftp: ServerSftpConfig {
                host: "127.0.0.1".to_string(),
                port: 2222,
                user: "sftp_user".to_string(),
                auth: SftpAuthConfig {
                    auth_type: SftpAuthType::Password,
                    password: Some("sftp_password".to_string()),
                    private_key_path: None,
                    passphrase: None,
                    // Set this to pin the server host key; leaving it unset
                    // accepts any host key.
                    host_key_sha256: None,
                },
                remote_modlist_path: "/modlist.html".to_string(),
                remote_mods_root: "/upload/mods".to_string(),
                max_retries: 3,
                backoff_ms: 500,
                operation_timeout_seconds: 30,
            },
            rcon: ServerRconConfig {
                host: "127.0.0.1".to_string(),
                port: 2306,
                password: "rcon_password".to_string(),
            },
        }],
    }
}
