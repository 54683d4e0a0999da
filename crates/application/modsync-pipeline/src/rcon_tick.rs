//! Restart countdown over RCON: periodic announcements while the grace
//! period runs, then the final message and the shutdown command.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use modsync_config::Config;
use modsync_core::Stage;
use modsync_infra::rcon::RconDialer;
use modsync_persistence::StateStore;

/// Whole minutes left before `deadline`, rounded up; 0 at or past it.
pub fn remaining_minutes(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (deadline - now).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis + 59_999) / 60_000
}

/// Substitute `{minutes}` in the announcement template.
pub fn format_message(template: &str, minutes: i64) -> String {
    template.replace("{minutes}", &minutes.to_string())
}

fn should_announce(now: DateTime<Utc>, next: Option<DateTime<Utc>>) -> bool {
    next.map(|at| now >= at).unwrap_or(true)
}

fn say_command(message: &str) -> String {
    format!("say -1 {message}")
}

#[async_trait]
pub trait RestartTicker: Send + Sync {
    async fn tick(&self, cancel: &CancellationToken, now: DateTime<Utc>, store: &dyn StateStore);
}

pub struct RconController {
    config: Arc<Config>,
    dialer: Arc<dyn RconDialer>,
}

impl RconController {
    pub fn new(config: Arc<Config>, dialer: Arc<dyn RconDialer>) -> Self {
        Self { config, dialer }
    }
}

#[async_trait]
impl RestartTicker for RconController {
    async fn tick(&self, cancel: &CancellationToken, now: DateTime<Utc>, store: &dyn StateStore) {
        let snapshot = match store.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "rcon tick could not load state");
                return;
            }
        };

        for server in &self.config.servers {
            if cancel.is_cancelled() {
                return;
            }
            let Some(server_state) = snapshot.servers.get(&server.id) else {
                continue;
            };
            if !server_state.needs_shutdown {
                continue;
            }

            let address = format!("{}:{}", server.rcon.host, server.rcon.port);
            let mut connection = match self.dialer.dial(&address, &server.rcon.password).await {
                Ok(connection) => connection,
                Err(e) => {
                    // State untouched; the next tick retries.
                    warn!(server_id = %server.id, error = %e, "rcon dial failed");
                    continue;
                }
            };

            let pending_deadline = server_state.shutdown_deadline_at.filter(|d| now < *d);

            if let Some(deadline) = pending_deadline {
                if !should_announce(now, server_state.next_announce_at) {
                    continue;
                }
                let minutes = remaining_minutes(deadline, now);
                let message =
                    format_message(&self.config.shutdown.message_template, minutes);
                match connection.command(&say_command(&message)).await {
                    Ok(_) => {
                        let next = now
                            + chrono::Duration::seconds(
                                self.config.shutdown.announce_every_seconds as i64,
                            );
                        let publish = store.update(&mut |state| {
                            let srv = state.servers.entry(server.id.clone()).or_default();
                            srv.next_announce_at = Some(next);
                            Ok(())
                        });
                        if let Err(e) = publish {
                            warn!(server_id = %server.id, error = %e, "persist announce time failed");
                        }
                    }
                    Err(e) => {
                        warn!(server_id = %server.id, error = %e, "rcon announce failed");
                    }
                }
            } else {
                if let Err(e) = connection
                    .command(&say_command(&self.config.shutdown.final_message))
                    .await
                {
                    warn!(server_id = %server.id, error = %e, "rcon final message failed");
                }
                match connection.command("#shutdown").await {
                    Ok(_) => {
                        let publish = store.update(&mut |state| {
                            let srv = state.servers.entry(server.id.clone()).or_default();
                            srv.needs_shutdown = false;
                            srv.stage = Stage::Idle;
                            srv.shutdown_sent_at = Some(now);
                            Ok(())
                        });
                        match publish {
                            Ok(_) => info!(server_id = %server.id, "shutdown command sent"),
                            Err(e) => {
                                warn!(server_id = %server.id, error = %e, "persist shutdown failed")
                            }
                        }
                    }
                    Err(e) => {
                        warn!(server_id = %server.id, error = %e, "rcon shutdown failed");
                    }
                }
            }
        }
    }
}
