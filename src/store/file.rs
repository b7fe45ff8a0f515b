//! File-backed store: `state.toml` plus an append-only `audit.jsonl`

use super::{STATE_VERSION, Store, StoreState, tail};
use crate::error::{Error, Result};
use crate::types::{AuditEntry, BatchOperation, LaneKey, MergeRequestRecord, MrKey};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Filename for engine state
pub const STATE_FILE: &str = "state.toml";

/// Filename for the audit log
pub const AUDIT_FILE: &str = "audit.jsonl";

/// Store persisting every mutation to disk
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
    audit_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store in `dir`, creating the directory if needed.
    ///
    /// A missing state file yields an empty state.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .map_err(|e| Error::Store(format!("failed to create {}: {e}", dir.display())))?;
        }

        let state = load_state(&dir.join(STATE_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(state),
            audit_lock: Mutex::new(()),
        })
    }

    /// Path of the state file
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Path of the audit log
    pub fn audit_path(&self) -> PathBuf {
        self.dir.join(AUDIT_FILE)
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a mutation and write the result while still holding the lock
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.state();
        let mut next = state.clone();
        let value = f(&mut next)?;
        save_state(&self.state_path(), &next)?;
        *state = next;
        Ok(value)
    }
}

/// Load state from disk, empty if the file doesn't exist
fn load_state(path: &Path) -> Result<StoreState> {
    if !path.exists() {
        return Ok(StoreState::new());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Store(format!("failed to read {}: {e}", path.display())))?;

    let state: StoreState = toml::from_str(&content)
        .map_err(|e| Error::Store(format!("failed to parse {}: {e}", path.display())))?;

    if state.version > STATE_VERSION {
        return Err(Error::Store(format!(
            "{} has version {}, newer than supported {STATE_VERSION}",
            path.display(),
            state.version
        )));
    }
    Ok(state)
}

/// Write state atomically (temp file + rename)
fn save_state(path: &Path, state: &StoreState) -> Result<()> {
    let mut state_to_save = state.clone();
    state_to_save.version = STATE_VERSION;

    let content = toml::to_string_pretty(&state_to_save)
        .map_err(|e| Error::Store(format!("failed to serialize state: {e}")))?;

    let content_with_header = format!(
        "# merge-assist engine state\n# Auto-generated - manual edits may be overwritten\n\n{content}"
    );

    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, content_with_header)
        .map_err(|e| Error::Store(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Store(format!("failed to replace {}: {e}", path.display())))?;
    Ok(())
}

impl Store for FileStore {
    fn load_mr(&self, key: &MrKey) -> Result<Option<MergeRequestRecord>> {
        Ok(self.state().load_mr(key))
    }

    fn save_mr(&self, record: &MergeRequestRecord) -> Result<()> {
        self.mutate(|s| {
            s.save_mr(record);
            Ok(())
        })
    }

    fn archive_mr(&self, record: &MergeRequestRecord) -> Result<()> {
        self.mutate(|s| {
            s.archive_mr(record);
            Ok(())
        })
    }

    fn lane_mrs(&self, lane: &LaneKey) -> Result<Vec<MergeRequestRecord>> {
        Ok(self.state().lane_mrs(lane))
    }

    fn active_mrs(&self) -> Result<Vec<MergeRequestRecord>> {
        Ok(self.state().mrs.clone())
    }

    fn archived_mrs(&self) -> Result<Vec<MergeRequestRecord>> {
        Ok(self.state().archived_mrs.clone())
    }

    fn active_batch(&self, lane: &LaneKey) -> Result<Option<BatchOperation>> {
        Ok(self.state().active_batch(lane))
    }

    fn active_batches(&self) -> Result<Vec<BatchOperation>> {
        Ok(self.state().batches.clone())
    }

    fn begin_batch(&self, batch: &BatchOperation) -> Result<()> {
        self.mutate(|s| s.begin_batch(batch))
    }

    fn save_batch(&self, batch: &BatchOperation) -> Result<()> {
        self.mutate(|s| s.save_batch(batch))
    }

    fn archive_batch(&self, batch: &BatchOperation) -> Result<()> {
        self.mutate(|s| {
            s.archive_batch(batch);
            Ok(())
        })
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let _guard = self.audit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.audit_path();
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Store(format!("failed to open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .map_err(|e| Error::Store(format!("failed to append to {}: {e}", path.display())))?;
        Ok(())
    }

    fn audit_log(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
        let _guard = self.audit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.audit_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Store(format!("failed to read {}: {e}", path.display())))?;

        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => entries.push(entry),
                // A torn final line after a crash should not hide the rest
                Err(e) => warn!(line = idx + 1, error = %e, "skipping unreadable audit entry"),
            }
        }
        Ok(tail(entries, limit))
    }
}
