//! Persistence for MR records, batch operations and the audit log
//!
//! The engine only talks to the [`Store`] trait. [`MemoryStore`] backs tests
//! and embedders; [`FileStore`] keeps `state.toml` and `audit.jsonl` in the
//! configured state directory.

mod file;
mod memory;

pub use file::{AUDIT_FILE, FileStore, STATE_FILE};
pub use memory::MemoryStore;

use crate::error::{Error, Result};
use crate::types::{
    AuditAction, AuditEntry, AuditSubject, BatchOperation, LaneKey, MergeRequestRecord, MrKey,
};
use serde::{Deserialize, Serialize};

/// Current state file format version
pub const STATE_VERSION: u32 = 1;

/// Storage interface used by lanes
pub trait Store: Send + Sync {
    /// Record by key, active or archived
    fn load_mr(&self, key: &MrKey) -> Result<Option<MergeRequestRecord>>;

    /// Insert or replace an active record. A stale archived copy is dropped.
    fn save_mr(&self, record: &MergeRequestRecord) -> Result<()>;

    /// Move a record to the archive
    fn archive_mr(&self, record: &MergeRequestRecord) -> Result<()>;

    /// Active records of a lane
    fn lane_mrs(&self, lane: &LaneKey) -> Result<Vec<MergeRequestRecord>>;

    /// All active records
    fn active_mrs(&self) -> Result<Vec<MergeRequestRecord>>;

    /// All archived records
    fn archived_mrs(&self) -> Result<Vec<MergeRequestRecord>>;

    /// The lane's active batch, if any
    fn active_batch(&self, lane: &LaneKey) -> Result<Option<BatchOperation>>;

    /// All active batches
    fn active_batches(&self) -> Result<Vec<BatchOperation>>;

    /// Register a new batch. Fails if the lane already has an active one.
    fn begin_batch(&self, batch: &BatchOperation) -> Result<()>;

    /// Persist a batch transition
    fn save_batch(&self, batch: &BatchOperation) -> Result<()>;

    /// Move a finished batch to the archive
    fn archive_batch(&self, batch: &BatchOperation) -> Result<()>;

    /// Append an audit entry
    fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Audit entries, oldest first, limited to the most recent `limit`
    fn audit_log(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>>;

    /// Append an audit entry stamped now
    fn audit(&self, subject: AuditSubject, action: AuditAction, reason: Option<String>) -> Result<()> {
        self.append_audit(&AuditEntry::now(subject, action, reason))
    }
}

/// Everything the store holds apart from the audit log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    /// Format version
    #[serde(default)]
    pub version: u32,
    /// Records still owned by the engine
    #[serde(default)]
    pub mrs: Vec<MergeRequestRecord>,
    /// Records in a terminal state
    #[serde(default)]
    pub archived_mrs: Vec<MergeRequestRecord>,
    /// Batches not yet completed or failed
    #[serde(default)]
    pub batches: Vec<BatchOperation>,
    /// Finished batches
    #[serde(default)]
    pub archived_batches: Vec<BatchOperation>,
}

impl StoreState {
    /// Empty state at the current version
    pub const fn new() -> Self {
        Self {
            version: STATE_VERSION,
            mrs: Vec::new(),
            archived_mrs: Vec::new(),
            batches: Vec::new(),
            archived_batches: Vec::new(),
        }
    }

    fn load_mr(&self, key: &MrKey) -> Option<MergeRequestRecord> {
        self.mrs
            .iter()
            .chain(self.archived_mrs.iter())
            .find(|r| &r.key == key)
            .cloned()
    }

    fn save_mr(&mut self, record: &MergeRequestRecord) {
        self.archived_mrs.retain(|r| r.key != record.key);
        match self.mrs.iter_mut().find(|r| r.key == record.key) {
            Some(existing) => *existing = record.clone(),
            None => self.mrs.push(record.clone()),
        }
    }

    fn archive_mr(&mut self, record: &MergeRequestRecord) {
        self.mrs.retain(|r| r.key != record.key);
        self.archived_mrs.retain(|r| r.key != record.key);
        self.archived_mrs.push(record.clone());
    }

    fn lane_mrs(&self, lane: &LaneKey) -> Vec<MergeRequestRecord> {
        self.mrs
            .iter()
            .filter(|r| r.key.project == lane.project && r.target_branch == lane.target_branch)
            .cloned()
            .collect()
    }

    fn active_batch(&self, lane: &LaneKey) -> Option<BatchOperation> {
        self.batches.iter().find(|b| &b.lane == lane).cloned()
    }

    fn begin_batch(&mut self, batch: &BatchOperation) -> Result<()> {
        if let Some(active) = self.batches.iter().find(|b| b.lane == batch.lane) {
            return Err(Error::Store(format!(
                "lane {} already has active batch {}",
                batch.lane, active.id
            )));
        }
        self.batches.push(batch.clone());
        Ok(())
    }

    fn save_batch(&mut self, batch: &BatchOperation) -> Result<()> {
        let existing = self
            .batches
            .iter_mut()
            .find(|b| b.id == batch.id)
            .ok_or_else(|| Error::Store(format!("batch {} is not active", batch.id)))?;
        *existing = batch.clone();
        Ok(())
    }

    fn archive_batch(&mut self, batch: &BatchOperation) {
        self.batches.retain(|b| b.id != batch.id);
        self.archived_batches.retain(|b| b.id != batch.id);
        self.archived_batches.push(batch.clone());
    }
}

/// Keep the most recent `limit` entries
fn tail<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit
        && items.len() > limit
    {
        items.drain(..items.len() - limit);
    }
    items
}
