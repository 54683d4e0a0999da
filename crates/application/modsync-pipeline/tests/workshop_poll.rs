mod common;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{instant, metadata, utf8, FakeMetadataClient};
use modsync_core::{ModState, ServerState, State};
use modsync_persistence::{FileStore, StateStore};
use modsync_pipeline::workshop_poll::{poll_workshop, WorkshopPollSettings};

fn settings() -> WorkshopPollSettings {
    WorkshopPollSettings {
        poll_interval: chrono::Duration::seconds(300),
        batch_size: 2,
        parallelism: 2,
    }
}

fn store_with(dir: &tempfile::TempDir, state: State) -> Arc<FileStore> {
    let store = Arc::new(FileStore::new(utf8(&dir.path().join("state.json"))));
    store.save(&state).unwrap();
    store
}

#[tokio::test]
async fn batches_due_mods_and_leaves_fresh_checks_alone() {
    let now = instant(1_700_000_100);
    let mut state = State::empty();
    state.mods.insert("1".to_string(), ModState::default());
    state.mods.insert(
        "2".to_string(),
        ModState {
            last_workshop_check_at: Some(now - chrono::Duration::seconds(10)),
            ..Default::default()
        },
    );
    state.mods.insert(
        "3".to_string(),
        ModState {
            last_workshop_check_at: Some(now - chrono::Duration::minutes(10)),
            ..Default::default()
        },
    );
    state.servers.insert(
        "a".to_string(),
        ServerState {
            last_mod_ids: vec!["1".to_string(), "2".to_string(), "3".to_string()],
            ..Default::default()
        },
    );
    state.servers.insert(
        "b".to_string(),
        ServerState {
            last_mod_ids: vec!["3".to_string()],
            ..Default::default()
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, state);
    let client = FakeMetadataClient::new(HashMap::from([
        ("1".to_string(), metadata("1", "One", 1_700_000_040)),
        ("3".to_string(), metadata("3", "Three", 1_700_000_040)),
    ]));

    let cancel = CancellationToken::new();
    poll_workshop(&cancel, store.as_ref(), client.as_ref(), &settings(), now)
        .await
        .unwrap();

    // Mod 2 was checked 10s ago: exactly one batch, with ids 1 and 3.
    assert_eq!(client.call_count(), 1);
    let mut batch = client.calls.lock().unwrap()[0].clone();
    batch.sort();
    assert_eq!(batch, vec!["1".to_string(), "3".to_string()]);

    let after = store.load().unwrap();
    assert_eq!(
        after.mods["2"].last_workshop_check_at,
        Some(now - chrono::Duration::seconds(10))
    );
    assert_eq!(after.mods["1"].last_workshop_check_at, Some(now));
    assert_eq!(after.mods["3"].last_workshop_check_at, Some(now));
    assert_eq!(after.mods["1"].last_title.as_deref(), Some("One"));
}

#[tokio::test]
async fn returns_mods_whose_local_copy_is_stale() {
    let now = instant(1_700_000_000);
    let mut state = State::empty();
    state.mods.insert(
        "1".to_string(),
        ModState {
            local_updated_at: Some(now - chrono::Duration::hours(2)),
            ..Default::default()
        },
    );
    state.mods.insert(
        "2".to_string(),
        ModState {
            local_updated_at: Some(now - chrono::Duration::hours(1)),
            ..Default::default()
        },
    );
    state.mods.insert("3".to_string(), ModState::default());
    state.servers.insert(
        "a".to_string(),
        ServerState {
            last_mod_ids: vec!["1".to_string(), "2".to_string(), "3".to_string()],
            ..Default::default()
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, state);
    let client = FakeMetadataClient::new(HashMap::from([
        // Mod 1 upstream is newer than the local copy.
        ("1".to_string(), metadata("1", "One", 1_699_996_400)),
        // Mod 2 upstream is older than the local copy.
        ("2".to_string(), metadata("2", "Two", 1_699_992_800)),
        // Mod 3 was never downloaded locally.
        ("3".to_string(), metadata("3", "Three", 1_699_998_200)),
    ]));

    let cancel = CancellationToken::new();
    let stale = poll_workshop(&cancel, store.as_ref(), client.as_ref(), &settings(), now)
        .await
        .unwrap();

    assert_eq!(stale, vec!["1".to_string(), "3".to_string()]);
}

#[tokio::test]
async fn upstream_timestamp_is_monotonic() {
    let now = instant(1_700_000_000);
    let newer = instant(1_700_005_000);
    let mut state = State::empty();
    state.mods.insert(
        "1".to_string(),
        ModState {
            workshop_updated_at: Some(newer),
            ..Default::default()
        },
    );
    state.servers.insert(
        "a".to_string(),
        ServerState {
            last_mod_ids: vec!["1".to_string()],
            ..Default::default()
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, state);
    // The endpoint reports an older update time than we already know.
    let client = FakeMetadataClient::new(HashMap::from([(
        "1".to_string(),
        metadata("1", "One", 1_700_000_000),
    )]));

    let cancel = CancellationToken::new();
    poll_workshop(&cancel, store.as_ref(), client.as_ref(), &settings(), now)
        .await
        .unwrap();

    let after = store.load().unwrap();
    assert_eq!(after.mods["1"].workshop_updated_at, Some(newer));
}

#[tokio::test]
async fn failed_batch_still_stamps_every_checked_id() {
    let now = instant(1_700_000_000);
    let mut state = State::empty();
    for id in ["1", "2", "3"] {
        state.mods.insert(id.to_string(), ModState::default());
    }
    state.servers.insert(
        "a".to_string(),
        ServerState {
            last_mod_ids: vec!["1".to_string(), "2".to_string(), "3".to_string()],
            ..Default::default()
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, state);
    // Batch size 1 puts each id in its own batch; the one holding mod 2
    // fails after retries.
    let client = FakeMetadataClient::with_failures(
        HashMap::from([
            ("1".to_string(), metadata("1", "One", 1_699_999_000)),
            ("3".to_string(), metadata("3", "Three", 1_699_999_000)),
        ]),
        std::collections::HashSet::from(["2".to_string()]),
    );

    let cancel = CancellationToken::new();
    let stale = poll_workshop(
        &cancel,
        store.as_ref(),
        client.as_ref(),
        &WorkshopPollSettings {
            poll_interval: chrono::Duration::seconds(300),
            batch_size: 1,
            parallelism: 2,
        },
        now,
    )
    .await
    .unwrap();

    // Never downloaded, so all three still need a local refresh.
    assert_eq!(
        stale,
        vec!["1".to_string(), "2".to_string(), "3".to_string()]
    );

    let after = store.load().unwrap();
    // Every checked id is stamped, the failed batch included, and the
    // succeeding batches' results survive.
    for id in ["1", "2", "3"] {
        assert_eq!(after.mods[id].last_workshop_check_at, Some(now), "{id}");
    }
    assert_eq!(after.mods["1"].last_title.as_deref(), Some("One"));
    assert_eq!(after.mods["3"].last_title.as_deref(), Some("Three"));
    assert!(after.mods["2"].last_title.is_none());
    assert!(after.mods["2"].workshop_updated_at.is_none());
}

#[tokio::test]
async fn no_candidates_means_no_calls() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, State::empty());
    let client = FakeMetadataClient::new(HashMap::new());

    let cancel = CancellationToken::new();
    let stale = poll_workshop(
        &cancel,
        store.as_ref(),
        client.as_ref(),
        &settings(),
        instant(1_700_000_000),
    )
    .await
    .unwrap();

    assert!(stale.is_empty());
    assert_eq!(client.call_count(), 0);
}
