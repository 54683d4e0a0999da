use std::collections::BTreeMap;
use std::time::UNIX_EPOCH;

use camino::Utf8Path;
use walkdir::WalkDir;

use modsync_core::plan::TreeEntry;

use crate::sync::SyncError;

/// Enumerate a local mod tree into slash-relative entries keyed by path,
/// with second-truncated mtimes. The root itself is not part of the tree;
/// a missing root is an error (the mod was supposed to be downloaded).
pub fn walk_local_tree(root: &Utf8Path) -> Result<BTreeMap<String, TreeEntry>, SyncError> {
    let mut tree = BTreeMap::new();
    for entry in WalkDir::new(root.as_std_path()) {
        let entry = entry.map_err(|e| SyncError::Local(std::io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(root.as_std_path())
            .map_err(|e| SyncError::Local(std::io::Error::other(e)))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel = slash_join(rel);
        let metadata = entry.metadata().map_err(|e| SyncError::Local(std::io::Error::other(e)))?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let is_dir = metadata.is_dir();
        tree.insert(
            rel.clone(),
            TreeEntry {
                path: rel,
                is_dir,
                size: if is_dir { 0 } else { metadata.len() },
                mtime,
            },
        );
    }
    Ok(tree)
}

fn slash_join(path: &std::path::Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}
