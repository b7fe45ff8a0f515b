//! Everything a lane operation needs, plus the side effects shared by the
//! single-merge path and batches

use crate::comments;
use crate::config::LaneSettings;
use crate::error::{Error, Result};
use crate::executor::{FinalizeFailure, MergeExecutor, best_effort};
use crate::platform::PlatformService;
use crate::scheduler::SchedulePolicy;
use crate::store::Store;
use crate::strikes::{StrikeOutcome, StrikeTracker};
use crate::types::{AuditAction, AuditSubject, LaneKey, MergeRequestRecord, MrStatus};
use std::sync::Arc;
use tracing::{info, warn};

/// Dependencies of one lane
pub struct LaneContext {
    /// Lane identity
    pub key: LaneKey,
    /// Remote for the lane's project
    pub platform: Arc<dyn PlatformService>,
    /// Shared store
    pub store: Arc<dyn Store>,
    /// Resolved settings
    pub settings: LaneSettings,
    /// Strike rules
    pub strikes: StrikeTracker,
}

impl LaneContext {
    /// Bundle a lane's dependencies
    pub fn new(
        key: LaneKey,
        platform: Arc<dyn PlatformService>,
        store: Arc<dyn Store>,
        settings: LaneSettings,
    ) -> Self {
        let strikes = StrikeTracker::new(settings.strike_threshold);
        Self {
            key,
            platform,
            store,
            settings,
            strikes,
        }
    }

    /// Scheduling policy for this lane
    pub const fn schedule_policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            batch_size: self.settings.batch_size,
            max_queue_delay: self.settings.max_queue_delay,
            partial: self.settings.partial_batch,
        }
    }

    /// The lane's canonical batch branch
    pub fn batch_branch(&self) -> String {
        self.settings.batch_branch(&self.key.target_branch)
    }

    /// Executor bound to this lane
    pub fn executor(&self) -> MergeExecutor<'_> {
        MergeExecutor::new(self.platform.as_ref(), &self.settings)
    }

    /// Audit an MR action
    pub fn audit_mr(
        &self,
        record: &MergeRequestRecord,
        action: AuditAction,
        reason: Option<String>,
    ) -> Result<()> {
        self.store
            .audit(AuditSubject::Mr(record.key.clone()), action, reason)
    }

    /// Post a comment, logging failures
    pub async fn comment(&self, number: u64, body: &str) {
        best_effort("comment", self.platform.add_comment(number, body)).await;
    }

    /// Add one label and remove others, logging failures
    pub async fn relabel(&self, number: u64, add: Option<&str>, remove: &[&str]) {
        for label in remove {
            best_effort("label removal", self.platform.remove_label(number, label)).await;
        }
        if let Some(label) = add {
            best_effort("label add", self.platform.add_label(number, label)).await;
        }
    }

    /// Put a record back in the queue without a strike. Its FCFS position
    /// (`queued_at`) is kept.
    pub fn requeue(&self, record: &mut MergeRequestRecord) -> Result<()> {
        record.status = MrStatus::Queued;
        record.batch_id = None;
        if record.queued_at.is_none() {
            record.queued_at = Some(chrono::Utc::now());
        }
        self.store.save_mr(record)
    }

    /// Terminal rejection: comment, labels, archive, audit
    pub async fn reject(&self, record: &mut MergeRequestRecord) -> Result<()> {
        record.status = MrStatus::Rejected;
        record.queued_at = None;
        record.batch_id = None;
        warn!(mr = %record.key, strikes = record.strikes, "MR rejected");

        let number = record.key.number;
        self.comment(number, &comments::rejected(&record.last_reasons, record.strikes))
            .await;
        let labels = &self.settings.labels;
        self.relabel(
            number,
            Some(labels.rejected.as_str()),
            &[labels.not_ready.as_str(), labels.ready_to_merge.as_str()],
        )
        .await;

        self.store.archive_mr(record)?;
        self.audit_mr(record, AuditAction::Rejected, Some(record.last_reasons.join("; ")))
    }

    /// Archive a record whose MR was closed or merged outside the engine
    pub fn archive_closed(&self, record: &mut MergeRequestRecord, reason: &str) -> Result<()> {
        info!(mr = %record.key, reason, "archiving MR closed outside the engine");
        record.status = MrStatus::Closed;
        record.queued_at = None;
        record.batch_id = None;
        self.store.archive_mr(record)?;
        self.audit_mr(record, AuditAction::Closed, Some(reason.to_string()))
    }

    /// Persist a successful merge
    pub fn record_merged(&self, record: &MergeRequestRecord, sha: Option<&str>) -> Result<()> {
        self.store.archive_mr(record)?;
        self.audit_mr(record, AuditAction::Merged, sha.map(ToString::to_string))
    }

    /// Apply a failed finalize to the record.
    ///
    /// Closed and retargeted MRs are archived without a strike. Every other
    /// failure is a strike.
    pub async fn finalize_failed(
        &self,
        record: &mut MergeRequestRecord,
        failure: &FinalizeFailure,
    ) -> Result<StrikeOutcome> {
        match failure {
            FinalizeFailure::NotOpen(state) => {
                self.archive_closed(record, &format!("MR is {state}"))?;
                return Ok(StrikeOutcome::Ignored);
            }
            FinalizeFailure::Retargeted(branch) => {
                // The lane owning the new target re-recognizes it on its next event
                self.archive_closed(record, &format!("retargeted to {branch}"))?;
                return Ok(StrikeOutcome::Ignored);
            }
            _ => {}
        }

        let reason = failure.to_string();
        let outcome = self.strikes.penalize(record, &reason);
        self.audit_mr(record, AuditAction::MergeFailed, Some(reason))?;

        match outcome {
            StrikeOutcome::Rejected { .. } => self.reject(record).await?,
            StrikeOutcome::Struck { count } => {
                warn!(mr = %record.key, strikes = count, "finalize failed, strike recorded");
                let labels = &self.settings.labels;
                self.relabel(
                    record.key.number,
                    Some(labels.not_ready.as_str()),
                    &[labels.ready_to_merge.as_str()],
                )
                .await;
                self.store.save_mr(record)?;
            }
            StrikeOutcome::Cleared { .. } | StrikeOutcome::Ignored => {
                self.store.save_mr(record)?;
            }
        }
        Ok(outcome)
    }

    /// The remote stayed unreachable while finalizing: requeue without a
    /// strike and tell the MR's author
    pub async fn finalize_errored(&self, record: &mut MergeRequestRecord, error: &Error) -> Result<()> {
        warn!(mr = %record.key, error = %error, "finalize aborted by API error");
        self.requeue(record)?;
        self.comment(record.key.number, &comments::error(&error.to_string()))
            .await;
        self.audit_mr(record, AuditAction::MergeFailed, Some(error.to_string()))
    }
}
