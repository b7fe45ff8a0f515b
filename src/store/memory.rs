//! In-memory store

use super::{Store, StoreState, tail};
use crate::error::Result;
use crate::types::{AuditEntry, BatchOperation, LaneKey, MergeRequestRecord, MrKey};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Store that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> StoreState {
        self.state().clone()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn load_mr(&self, key: &MrKey) -> Result<Option<MergeRequestRecord>> {
        Ok(self.state().load_mr(key))
    }

    fn save_mr(&self, record: &MergeRequestRecord) -> Result<()> {
        self.state().save_mr(record);
        Ok(())
    }

    fn archive_mr(&self, record: &MergeRequestRecord) -> Result<()> {
        self.state().archive_mr(record);
        Ok(())
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
        self.state().begin_batch(batch)
    }

    fn save_batch(&self, batch: &BatchOperation) -> Result<()> {
        self.state().save_batch(batch)
    }

    fn archive_batch(&self, batch: &BatchOperation) -> Result<()> {
        self.state().archive_batch(batch);
        Ok(())
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    fn audit_log(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
        let entries = self
            .audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(tail(entries, limit))
    }
}
