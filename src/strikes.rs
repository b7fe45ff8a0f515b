//! Strike tracking - per-MR failure counter and terminal rejection

use crate::readiness::Verdict;
use crate::types::{MergeRequestRecord, MrStatus};
use chrono::Utc;

/// What a verdict (or penalty) did to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeOutcome {
    /// Ready: counter reset, MR queued
    Cleared {
        /// Whether the MR just entered the queue (was not queued before)
        newly_queued: bool,
    },
    /// NotReady: counter incremented, still under the threshold
    Struck {
        /// Counter after the increment
        count: u32,
    },
    /// Counter went over the threshold: terminal rejection
    Rejected {
        /// Counter after the increment
        count: u32,
    },
    /// Record is terminal or owned by a running operation; nothing changed
    Ignored,
}

/// Applies verdicts to records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrikeTracker {
    threshold: u32,
}

impl StrikeTracker {
    /// Reject once the counter exceeds `threshold`
    pub const fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// Configured threshold
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Apply a validator verdict.
    ///
    /// Ready resets the counter and queues the MR. NotReady adds a strike,
    /// rejecting once the counter exceeds the threshold. Terminal and
    /// in-flight records are left alone.
    pub fn record_verdict(&self, record: &mut MergeRequestRecord, verdict: &Verdict) -> StrikeOutcome {
        if record.status.is_terminal() || record.status.is_in_flight() {
            return StrikeOutcome::Ignored;
        }

        match verdict {
            Verdict::Ready => {
                record.strikes = 0;
                record.last_reasons.clear();
                let newly_queued = record.status != MrStatus::Queued;
                if newly_queued {
                    record.status = MrStatus::Queued;
                    record.queued_at = Some(Utc::now());
                }
                StrikeOutcome::Cleared { newly_queued }
            }
            Verdict::NotReady(_) => {
                record.last_reasons = verdict.reason_strings();
                self.strike(record)
            }
        }
    }

    /// Add a strike for a failure outside the validator (finalize-phase
    /// pipeline failure). Same threshold rule as [`Self::record_verdict`].
    pub fn penalize(&self, record: &mut MergeRequestRecord, reason: &str) -> StrikeOutcome {
        if record.status.is_terminal() {
            return StrikeOutcome::Ignored;
        }
        record.last_reasons = vec![reason.to_string()];
        self.strike(record)
    }

    fn strike(&self, record: &mut MergeRequestRecord) -> StrikeOutcome {
        record.strikes += 1;
        record.queued_at = None;
        record.batch_id = None;
        if record.strikes > self.threshold {
            record.status = MrStatus::Rejected;
            StrikeOutcome::Rejected {
                count: record.strikes,
            }
        } else {
            record.status = MrStatus::NotReady;
            StrikeOutcome::Struck {
                count: record.strikes,
            }
        }
    }
}
