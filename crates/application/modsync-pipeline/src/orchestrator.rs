//! The orchestrator owns the four tickers and drives every pipeline. All
//! state flows through the store; the downloader is serialized behind one
//! mutex; fan-outs are bounded by the configured parallelism.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use modsync_config::Config;
use modsync_core::modlist::apply_poll_result;
use modsync_core::Clock;
use modsync_infra::steamcmd::WorkshopDownloader;
use modsync_infra::workshop::MetadataClient;
use modsync_persistence::StateStore;

use crate::download::run_download_cycle;
use crate::modlist_poll::ModlistSource;
use crate::sync::ServerSyncer;
use crate::workshop_poll::{poll_workshop, WorkshopPollSettings};
use crate::{PipelineError, RestartTicker};

/// The collaborators the orchestrator drives; tests substitute fakes.
pub struct Dependencies {
    pub store: Arc<dyn StateStore>,
    pub modlist: Arc<dyn ModlistSource>,
    pub metadata: Arc<dyn MetadataClient>,
    pub downloader: Arc<dyn WorkshopDownloader>,
    pub syncer: Arc<dyn ServerSyncer>,
    pub rcon: Arc<dyn RestartTicker>,
    pub clock: Arc<dyn Clock>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    deps: Dependencies,
    downloader_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, deps: Dependencies) -> Self {
        Self {
            config,
            deps,
            downloader_lock: Mutex::new(()),
        }
    }

    /// Tick until cancelled, then flush once and return.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let intervals = &self.config.intervals;
        info!(
            modlist_poll_seconds = intervals.modlist_poll_seconds,
            workshop_poll_seconds = intervals.workshop_poll_seconds,
            rcon_tick_seconds = intervals.rcon_tick_seconds,
            state_flush_seconds = intervals.state_flush_seconds,
            servers = self.config.servers.len(),
            "orchestrator started"
        );

        let mut modlist_ticker = ticker(intervals.modlist_poll_seconds);
        let mut workshop_ticker = ticker(intervals.workshop_poll_seconds);
        let mut rcon_ticker = ticker(intervals.rcon_tick_seconds);
        let mut flush_ticker = ticker(intervals.state_flush_seconds);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let result = self.flush_state();
                    info!("orchestrator stopping");
                    return result;
                }
                _ = modlist_ticker.tick() => self.run_modlist_poll(&cancel).await,
                _ = workshop_ticker.tick() => self.run_workshop_poll(&cancel).await,
                _ = rcon_ticker.tick() => self.run_rcon_tick(&cancel).await,
                _ = flush_ticker.tick() => {
                    if let Err(e) = self.flush_state() {
                        error!(error = %e, "state flush failed");
                    }
                }
            }
        }
    }

    /// Fan per-server modlist polls out behind the poll semaphore and merge
    /// each success through a single store update.
    pub async fn run_modlist_poll(&self, cancel: &CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(
            self.config.concurrency.modlist_poll_parallelism.max(1),
        ));
        let mut tasks = tokio::task::JoinSet::new();

        for server in self.config.servers.iter().cloned() {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let modlist = self.deps.modlist.clone();
            let store = self.deps.store.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = semaphore.acquire_owned() => permit,
                };
                let _permit = match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let result = match modlist.poll(&cancel, &server).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(server_id = %server.id, error = %e, "modlist poll failed");
                        return;
                    }
                };
                let merged = store.update(&mut |state| {
                    apply_poll_result(state, &server.id, &result);
                    Ok(())
                });
                if let Err(e) = merged {
                    error!(server_id = %server.id, error = %e, "persist modlist poll failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Poll workshop metadata; when anything is stale, download under the
    /// process-wide downloader mutex, then run the sync engine.
    pub async fn run_workshop_poll(&self, cancel: &CancellationToken) {
        let settings = WorkshopPollSettings {
            poll_interval: chrono::Duration::seconds(
                self.config.intervals.workshop_poll_seconds as i64,
            ),
            batch_size: self.config.concurrency.workshop_batch_size,
            parallelism: self.config.concurrency.workshop_parallelism,
        };
        let now = self.deps.clock.now();
        let stale = match poll_workshop(
            cancel,
            self.deps.store.as_ref(),
            self.deps.metadata.as_ref(),
            &settings,
            now,
        )
        .await
        {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "workshop poll failed");
                return;
            }
        };
        if stale.is_empty() {
            return;
        }
        info!(mods = stale.len(), "workshop reports stale mods");

        {
            let _serialized = self.downloader_lock.lock().await;
            let download = run_download_cycle(
                cancel,
                self.deps.store.as_ref(),
                self.deps.downloader.as_ref(),
                &stale,
                self.deps.clock.now(),
            )
            .await;
            match download {
                Ok(report) if !report.failed.is_empty() => {
                    warn!(
                        failed = report.failed.len(),
                        "download cycle left some mods stale"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "download cycle failed");
                    return;
                }
            }
        }

        if let Err(e) = self
            .deps
            .syncer
            .sync_servers(cancel, self.deps.store.as_ref())
            .await
        {
            error!(error = %e, "sftp sync phase failed");
        }
    }

    pub async fn run_rcon_tick(&self, cancel: &CancellationToken) {
        let now = self.deps.clock.now();
        self.deps
            .rcon
            .tick(cancel, now, self.deps.store.as_ref())
            .await;
    }

    /// Heartbeat write: re-save the current document even when unchanged.
    pub fn flush_state(&self) -> Result<(), PipelineError> {
        let snapshot = self.deps.store.load()?;
        self.deps.store.save(&snapshot)?;
        Ok(())
    }
}

fn ticker(period_seconds: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(period_seconds.max(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
