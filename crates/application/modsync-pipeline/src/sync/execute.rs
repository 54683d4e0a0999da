//! Blocking execution of one mod's sync plan against a shared SFTP
//! session. Runs on a blocking task; cancellation is observed between
//! operations. The session mutex serializes wire operations, matching the
//! one-session-per-server model.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;

use modsync_core::plan::{build_plan, SyncPlan, TreeEntry};
use modsync_infra::sftp::{join_remote, SftpSession};

use crate::sync::{local::walk_local_tree, SyncError};

type SharedSession = Mutex<Box<dyn SftpSession>>;

/// Reconcile one mod directory: enumerate both trees, plan, execute.
pub fn sync_mod_tree(
    cancel: &CancellationToken,
    session: &SharedSession,
    local_root: &Utf8Path,
    remote_root: &str,
) -> Result<(), SyncError> {
    let local = walk_local_tree(local_root)?;
    let remote: BTreeMap<String, TreeEntry> = {
        let guard = session.lock().expect("sftp session lock poisoned");
        // The mod root must exist before any top-level file upload.
        guard.mkdir_all(remote_root)?;
        guard
            .walk_tree(remote_root)?
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect()
    };
    let plan = build_plan(&local, &remote);
    execute_plan(cancel, session, &plan, local_root, remote_root)
}

/// Apply a plan in its deterministic order. Any error aborts; the state
/// tally in the engine keeps `needs_mod_update` raised so the next cycle
/// re-plans from whatever the remote tree now holds.
pub fn execute_plan(
    cancel: &CancellationToken,
    session: &SharedSession,
    plan: &SyncPlan,
    local_root: &Utf8Path,
    remote_root: &str,
) -> Result<(), SyncError> {
    let guard = || session.lock().expect("sftp session lock poisoned");

    for entry in &plan.delete_type_conflicts {
        check_cancel(cancel)?;
        let path = join_remote(remote_root, &entry.path);
        if entry.is_dir {
            guard().remove_dir(&path)?;
        } else {
            guard().remove_file(&path)?;
        }
    }
    for dir in &plan.mkdirs {
        check_cancel(cancel)?;
        guard().mkdir_all(&join_remote(remote_root, &dir.path))?;
    }
    for file in &plan.uploads {
        check_cancel(cancel)?;
        upload_atomic(
            session,
            &local_root.join(&file.path),
            &join_remote(remote_root, &file.path),
            file.mtime,
        )?;
    }
    for file in &plan.delete_extra_files {
        check_cancel(cancel)?;
        guard().remove_file(&join_remote(remote_root, &file.path))?;
    }
    for dir in &plan.delete_extra_dirs {
        check_cancel(cancel)?;
        guard().remove_dir(&join_remote(remote_root, &dir.path))?;
    }
    Ok(())
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

/// Atomic per-file upload: stream into a sibling temp name, rename over the
/// target, then stamp atime=mtime with the local second-truncated mtime.
/// A failed stream or rename removes the temp file before propagating.
pub fn upload_atomic(
    session: &SharedSession,
    local_path: &Utf8Path,
    remote_path: &str,
    mtime_secs: i64,
) -> Result<(), SyncError> {
    let mut source = std::fs::File::open(local_path).map_err(SyncError::Local)?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let tmp_path = format!("{remote_path}.tmp-{nanos}");

    let guard = session.lock().expect("sftp session lock poisoned");
    {
        let mut dest = guard.create(&tmp_path)?;
        let streamed = std::io::copy(&mut source, &mut dest).and_then(|_| dest.flush());
        if let Err(e) = streamed {
            drop(dest);
            let _ = guard.remove_file(&tmp_path);
            return Err(SyncError::Local(e));
        }
    }
    if let Err(e) = guard.rename(&tmp_path, remote_path) {
        let _ = guard.remove_file(&tmp_path);
        return Err(e.into());
    }
    guard.set_times(remote_path, mtime_secs)?;
    Ok(())
}
