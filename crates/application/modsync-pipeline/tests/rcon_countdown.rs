mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{instant, test_config, utf8, FakeRconDialer};
use modsync_core::{ServerState, Stage, State};
use modsync_persistence::{FileStore, StateStore};
use modsync_pipeline::{RconController, RestartTicker};

fn seeded_store(dir: &tempfile::TempDir, server: ServerState) -> Arc<FileStore> {
    let mut state = State::empty();
    state.servers.insert("s1".to_string(), server);
    let store = Arc::new(FileStore::new(utf8(&dir.path().join("state.json"))));
    store.save(&state).unwrap();
    store
}

#[tokio::test]
async fn countdown_announces_then_shuts_down() {
    let now = instant(1_700_000_000);
    let deadline = now + chrono::Duration::seconds(90);
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(
        &dir,
        ServerState {
            needs_shutdown: true,
            stage: Stage::Countdown,
            shutdown_deadline_at: Some(deadline),
            ..Default::default()
        },
    );

    let config = Arc::new(test_config(&utf8(dir.path())));
    let dialer = FakeRconDialer::new();
    let controller = RconController::new(config, dialer.clone());
    let cancel = CancellationToken::new();

    // First tick, 90s before the deadline: one announcement, ceil to 2 min.
    controller.tick(&cancel, now, store.as_ref()).await;
    assert_eq!(dialer.sent(), vec!["say -1 Restart in 2 minutes".to_string()]);
    let state = store.load().unwrap();
    let server = &state.servers["s1"];
    assert!(server.needs_shutdown);
    assert_eq!(
        server.next_announce_at,
        Some(now + chrono::Duration::seconds(30))
    );

    // Second tick at the same instant: cadence suppresses the announcement.
    dialer.clear();
    controller.tick(&cancel, now, store.as_ref()).await;
    assert!(dialer.sent().is_empty());

    // Past the deadline: final message then the shutdown command.
    dialer.clear();
    let after = now + chrono::Duration::seconds(120);
    controller.tick(&cancel, after, store.as_ref()).await;
    assert_eq!(
        dialer.sent(),
        vec![
            "say -1 Server shutting down now".to_string(),
            "#shutdown".to_string(),
        ]
    );
    let state = store.load().unwrap();
    let server = &state.servers["s1"];
    assert!(!server.needs_shutdown);
    assert_eq!(server.stage, Stage::Idle);
    assert_eq!(server.shutdown_sent_at, Some(after));
}

#[tokio::test]
async fn dial_failure_leaves_state_untouched() {
    let now = instant(1_700_000_000);
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(
        &dir,
        ServerState {
            needs_shutdown: true,
            stage: Stage::Countdown,
            shutdown_deadline_at: Some(now + chrono::Duration::seconds(60)),
            ..Default::default()
        },
    );

    let config = Arc::new(test_config(&utf8(dir.path())));
    let dialer = FakeRconDialer::new();
    dialer.fail_dial.store(true, Ordering::SeqCst);
    let controller = RconController::new(config, dialer.clone());

    controller
        .tick(&CancellationToken::new(), now, store.as_ref())
        .await;

    assert!(dialer.sent().is_empty());
    let state = store.load().unwrap();
    let server = &state.servers["s1"];
    assert!(server.needs_shutdown);
    assert_eq!(server.stage, Stage::Countdown);
    assert!(server.next_announce_at.is_none());
}

#[tokio::test]
async fn servers_without_pending_shutdown_are_skipped() {
    let now = instant(1_700_000_000);
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, ServerState::default());

    let config = Arc::new(test_config(&utf8(dir.path())));
    let dialer = FakeRconDialer::new();
    let controller = RconController::new(config, dialer.clone());

    controller
        .tick(&CancellationToken::new(), now, store.as_ref())
        .await;
    assert!(dialer.sent().is_empty());
}
