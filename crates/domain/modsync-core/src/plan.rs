//! Three-way tree reconciliation planner. Pure: both trees are maps from
//! slash-normalized relative path to entry metadata; the output is the
//! minimal ordered mutation that makes the remote tree mirror the local one.

use std::collections::BTreeMap;

/// One node of a local or remote tree. File equality is `(is_dir, size,
/// mtime)` with mtime truncated to whole seconds so both sides agree after
/// a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Slash-separated path relative to the mod root.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Unix seconds, already second-truncated.
    pub mtime: i64,
}

impl TreeEntry {
    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            size: 0,
            mtime: 0,
        }
    }

    pub fn file(path: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            size,
            mtime,
        }
    }
}

/// The five ordered operation lists. Execution order is the field order;
/// the sorts within each list keep the remote tree valid at every step.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub delete_type_conflicts: Vec<TreeEntry>,
    pub mkdirs: Vec<TreeEntry>,
    pub uploads: Vec<TreeEntry>,
    pub delete_extra_files: Vec<TreeEntry>,
    pub delete_extra_dirs: Vec<TreeEntry>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.delete_type_conflicts.is_empty()
            && self.mkdirs.is_empty()
            && self.uploads.is_empty()
            && self.delete_extra_files.is_empty()
            && self.delete_extra_dirs.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.delete_type_conflicts.len()
            + self.mkdirs.len()
            + self.uploads.len()
            + self.delete_extra_files.len()
            + self.delete_extra_dirs.len()
    }
}

/// Number of components in a relative path; the empty path has depth 0.
pub fn path_depth(path: &str) -> usize {
    if path.is_empty() {
        return 0;
    }
    path.matches('/').count() + 1
}

/// Plan the minimal remote mutation. One pass over local keys classifies
/// missing/conflicting/stale entries, one pass over remote keys finds
/// extras, and each list is then ordered deterministically:
/// type-conflict deletes deepest first, mkdirs shallowest first
/// (lexicographic tie-break), uploads and file deletes lexicographic,
/// directory deletes deepest first (reverse-lexicographic tie-break).
pub fn build_plan(
    local: &BTreeMap<String, TreeEntry>,
    remote: &BTreeMap<String, TreeEntry>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for (rel, local_entry) in local {
        match remote.get(rel) {
            None => {
                if local_entry.is_dir {
                    plan.mkdirs.push(local_entry.clone());
                } else {
                    plan.uploads.push(local_entry.clone());
                }
            }
            Some(remote_entry) if local_entry.is_dir != remote_entry.is_dir => {
                plan.delete_type_conflicts.push(remote_entry.clone());
                if local_entry.is_dir {
                    plan.mkdirs.push(local_entry.clone());
                } else {
                    plan.uploads.push(local_entry.clone());
                }
            }
            Some(remote_entry) => {
                if !local_entry.is_dir
                    && (local_entry.size != remote_entry.size
                        || local_entry.mtime != remote_entry.mtime)
                {
                    plan.uploads.push(local_entry.clone());
                }
            }
        }
    }

    for (rel, remote_entry) in remote {
        if local.contains_key(rel) {
            continue;
        }
        if remote_entry.is_dir {
            plan.delete_extra_dirs.push(remote_entry.clone());
        } else {
            plan.delete_extra_files.push(remote_entry.clone());
        }
    }

    plan.delete_type_conflicts
        .sort_by(|a, b| path_depth(&b.path).cmp(&path_depth(&a.path)));
    plan.mkdirs.sort_by(|a, b| {
        path_depth(&a.path)
            .cmp(&path_depth(&b.path))
            .then_with(|| a.path.cmp(&b.path))
    });
    plan.uploads.sort_by(|a, b| a.path.cmp(&b.path));
    plan.delete_extra_files.sort_by(|a, b| a.path.cmp(&b.path));
    plan.delete_extra_dirs.sort_by(|a, b| {
        path_depth(&b.path)
            .cmp(&path_depth(&a.path))
            .then_with(|| b.path.cmp(&a.path))
    });

    plan
}
