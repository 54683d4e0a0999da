use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modsync_core::{State, SystemClock};
use modsync_infra::rcon::TcpRconDialer;
use modsync_infra::redact::redact_field;
use modsync_infra::sftp::Ssh2Connector;
use modsync_infra::steamcmd::SteamCmdRunner;
use modsync_infra::workshop::WebApiClient;
use modsync_persistence::{FileStore, StateStore};
use modsync_pipeline::{
    Dependencies, Orchestrator, RconController, SftpModlistPoller, SftpSyncEngine,
};

#[derive(Parser)]
#[command(author, version, about = "Workshop mod sync daemon for game server fleets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Run {
        #[arg(long, default_value = "config.json")]
        config: Utf8PathBuf,
    },
    /// Print a sample config.json to stdout
    PrintSampleConfig,
    /// Print a sample empty state.json to stdout
    PrintSampleState,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::PrintSampleConfig => {
            println!(
                "{}",
                serde_json::to_string_pretty(&modsync_config::sample())?
            );
            Ok(())
        }
        Commands::PrintSampleState => {
            println!("{}", serde_json::to_string_pretty(&State::empty())?);
            Ok(())
        }
    }
}

async fn run(config_path: Utf8PathBuf) -> anyhow::Result<()> {
    let config = Arc::new(modsync_config::load(&config_path).context("load config")?);

    let store = Arc::new(FileStore::new(config.state_path.clone()));
    // Fail fast on an unreadable or newer-schema state document.
    store.load().context("load state")?;

    info!(
        config = %config_path,
        state_path = %config.state_path,
        servers = config.servers.len(),
        steam_login = %config.steam.login,
        steam_password = redact_field("steam_password", &config.steam.password),
        "starting daemon"
    );

    let clock = Arc::new(SystemClock);
    let connector = Arc::new(Ssh2Connector);
    let modlist = Arc::new(SftpModlistPoller::new(
        connector.clone(),
        config.paths.local_cache_root.clone(),
    ));
    let metadata = Arc::new(WebApiClient::new(&config.steam).context("build workshop client")?);
    let downloader = Arc::new(SteamCmdRunner::new(&config.paths, &config.steam));
    let syncer = Arc::new(SftpSyncEngine::new(
        config.clone(),
        connector.clone(),
        clock.clone(),
    ));
    let rcon = Arc::new(RconController::new(
        config.clone(),
        Arc::new(TcpRconDialer),
    ));

    let orchestrator = Orchestrator::new(
        config,
        Dependencies {
            store,
            modlist,
            metadata,
            downloader,
            syncer,
            rcon,
            clock,
        },
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    orchestrator.run(cancel).await?;
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!(error = %e, "cannot install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
}
