use std::fs;
use std::io::Write;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use modsync_core::{State, STATE_SCHEMA_VERSION};

use crate::{StateStore, StoreError};

/// File-backed store for the single state document. One mutex serializes
/// every mutation; `update` always re-reads the durable file so a mutator
/// sees the latest persisted state, and its result is durable before
/// `update` returns.
pub struct FileStore {
    path: Utf8PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<State, StoreError> {
        let _guard = self.lock.lock().expect("state store lock poisoned");
        load_document(&self.path)
    }

    fn save(&self, state: &State) -> Result<(), StoreError> {
        let _guard = self.lock.lock().expect("state store lock poisoned");
        save_atomic(&self.path, state.clone())
    }

    fn update(
        &self,
        mutator: &mut dyn FnMut(&mut State) -> Result<(), StoreError>,
    ) -> Result<State, StoreError> {
        let _guard = self.lock.lock().expect("state store lock poisoned");
        let mut state = load_document(&self.path)?;
        mutator(&mut state)?;
        save_atomic(&self.path, state.clone())?;
        Ok(state)
    }
}

/// Read and normalize the document. A missing file is the empty version-1
/// document; malformed JSON is an error, never a silent reset.
pub fn load_document(path: &Utf8Path) -> Result<State, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(State::empty()),
        Err(e) => return Err(StoreError::Read(e)),
    };
    let mut state: State = serde_json::from_slice(&bytes)?;
    state.normalize();
    if state.version > STATE_SCHEMA_VERSION {
        return Err(StoreError::NewerSchema {
            found: state.version,
            supported: STATE_SCHEMA_VERSION,
        });
    }
    Ok(state)
}

/// Write via a sibling temp file and rename over the target, so a reader
/// observes either the prior or the new document, never a truncated one.
/// The temp file is removed on any failure and the original left untouched.
pub fn save_atomic(path: &Utf8Path, mut state: State) -> Result<(), StoreError> {
    state.normalize();
    state.updated_at = Some(Utc::now());

    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            fs::create_dir_all(parent).map_err(StoreError::Write)?;
        }
    }

    let tmp_path = sibling_temp_path(path);
    let result = write_and_swap(&tmp_path, path, &state);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_and_swap(tmp_path: &Utf8Path, path: &Utf8Path, state: &State) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(state)?;
    let mut file = fs::File::create(tmp_path).map_err(StoreError::Write)?;
    file.write_all(&body).map_err(StoreError::Write)?;
    file.sync_all().map_err(StoreError::Write)?;
    drop(file);
    fs::rename(tmp_path, path).map_err(StoreError::Write)
}

fn sibling_temp_path(path: &Utf8Path) -> Utf8PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let file_name = path.file_name().unwrap_or("state.json");
    let tmp_name = format!(".{file_name}.tmp-{}-{nanos}", std::process::id());
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.join(tmp_name),
        _ => Utf8PathBuf::from(tmp_name),
    }
}
