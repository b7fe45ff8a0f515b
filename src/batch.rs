//! Batch merges - one proof pipeline for several MRs
//!
//! A batch runs the state machine
//! `Creating → MergingMembers → ProofPending → ProofPipelineWait →
//! {ProofSuccess | ProofFailed} → FinalizingMembers → Completed | Failed`,
//! persisting the [`BatchOperation`] on every transition.
//!
//! The batch branch name is fixed per lane, so a leftover branch from an
//! interrupted run is always found and replaced.

use crate::comments;
use crate::error::{Error, Result};
use crate::executor::{
    FinalizeOutcome, MergeContext, PipelineOutcome, PipelineTarget, best_effort, wait_for_pipeline,
};
use crate::lane::LaneContext;
use crate::platform::PlatformService;
use crate::types::{
    AuditAction, AuditSubject, BatchOperation, BatchStatus, BranchMergeOutcome, MrKey, MrStatus,
};
use crate::wait::{CancelToken, PollSettings};
use chrono::Utc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Upper bound on cleanup after a cancelled batch
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// What a batch run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Batch identity
    pub batch_id: uuid::Uuid,
    /// Final state (Completed or Failed)
    pub status: BatchStatus,
    /// Members merged into the target
    pub merged: Vec<MrKey>,
    /// Members whose finalize failed (strike recorded)
    pub failed: Vec<MrKey>,
    /// Members dropped while building the batch branch
    pub excluded: Vec<MrKey>,
    /// Members returned to the queue without a strike
    pub requeued: Vec<MrKey>,
    /// Systemic failure description
    pub error: Option<String>,
}

impl BatchReport {
    fn new(batch: &BatchOperation) -> Self {
        Self {
            batch_id: batch.id,
            status: batch.status,
            merged: Vec::new(),
            failed: Vec::new(),
            excluded: Vec::new(),
            requeued: Vec::new(),
            error: None,
        }
    }
}

/// Reset the lane's batch branch to the head of the target (EFFECTFUL).
///
/// Any proof MR still open from an earlier run is closed first. Running this
/// twice in a row leaves the same state as running it once.
pub async fn prepare_batch_branch(
    platform: &dyn PlatformService,
    branch: &str,
    target: &str,
) -> Result<()> {
    if platform.branch_exists(branch).await? {
        info!(branch, "removing stale batch branch");
        if let Some(stale) = platform.find_open_mr(branch, target).await? {
            platform.close_mr(stale.number).await?;
        }
        platform.delete_branch(branch).await?;
    }
    platform.create_branch(branch, target).await
}

/// Close the proof MR and delete the batch branch (EFFECTFUL)
async fn teardown(platform: &dyn PlatformService, batch: &BatchOperation) -> Result<()> {
    let proof = match batch.proof_mr {
        Some(number) => Some(number),
        None => platform
            .find_open_mr(&batch.branch, &batch.lane.target_branch)
            .await?
            .map(|pr| pr.number),
    };
    if let Some(number) = proof {
        match platform.close_mr(number).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    platform.delete_branch(&batch.branch).await
}

/// Drives one batch for a lane
pub struct BatchManager<'a> {
    ctx: &'a LaneContext,
    cancel: &'a CancelToken,
}

impl<'a> BatchManager<'a> {
    /// Create a manager for the lane
    pub const fn new(ctx: &'a LaneContext, cancel: &'a CancelToken) -> Self {
        Self { ctx, cancel }
    }

    /// Run a batch over `members`, in order (EFFECTFUL).
    ///
    /// Members must be Queued. Systemic failures end in a Failed batch and are
    /// reported, not returned; `Err` is reserved for store failures and
    /// cancellation.
    #[instrument(skip_all, fields(lane = %self.ctx.key, size = members.len()))]
    pub async fn run(&self, members: Vec<MrKey>) -> Result<BatchReport> {
        let mut batch =
            BatchOperation::new(self.ctx.key.clone(), self.ctx.batch_branch(), members, Utc::now());
        self.ctx.store.begin_batch(&batch)?;

        for key in &batch.members {
            let mut record = self.load_member(key)?;
            record.status = MrStatus::InBatch;
            record.batch_id = Some(batch.id);
            self.ctx.store.save_mr(&record)?;
        }
        self.audit(&batch, AuditAction::BatchStarted, Some(member_list(&batch.members)))?;
        info!(batch_id = %batch.id, members = %member_list(&batch.members), "batch started");

        let mut report = BatchReport::new(&batch);
        match self.drive(&mut batch, &mut report).await {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                warn!(batch_id = %batch.id, status = %batch.status, "batch interrupted by shutdown");
                self.ctx.store.save_batch(&batch)?;
                match tokio::time::timeout(
                    TEARDOWN_TIMEOUT,
                    teardown(self.ctx.platform.as_ref(), &batch),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(batch_id = %batch.id, error = %e, "teardown failed, recovery will finish it");
                    }
                    Err(_) => {
                        warn!(batch_id = %batch.id, "teardown timed out, recovery will finish it");
                    }
                }
                return Err(Error::Cancelled);
            }
            Err(e @ Error::Store(_)) => return Err(e),
            Err(e) => self.fail(&mut batch, &mut report, &e.to_string()).await?,
        }

        report.status = batch.status;
        report.excluded.clone_from(&batch.excluded);
        Ok(report)
    }

    async fn drive(&self, batch: &mut BatchOperation, report: &mut BatchReport) -> Result<()> {
        let platform = self.ctx.platform.as_ref();
        let target = self.ctx.key.target_branch.clone();

        // Creating
        prepare_batch_branch(platform, &batch.branch, &target).await?;
        self.transition(batch, BatchStatus::MergingMembers)?;

        // MergingMembers
        for key in batch.members.clone() {
            let record = self.load_member(&key)?;
            let outcome = platform
                .merge_branch_into_branch(&record.source_branch, &batch.branch, true)
                .await;
            let reason = match outcome {
                Ok(BranchMergeOutcome::Merged { .. }) => continue,
                Ok(BranchMergeOutcome::Conflict) => {
                    "Conflicts with the target branch or another MR in the batch".to_string()
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => e.to_string(),
            };
            self.exclude(batch, &key, &reason).await?;
        }

        if batch.active_members().next().is_none() {
            return Err(Error::Platform(
                "no member could be merged into the batch branch".to_string(),
            ));
        }
        self.transition(batch, BatchStatus::ProofPending)?;

        // ProofPending
        let active: Vec<MrKey> = batch.active_members().cloned().collect();
        let proof = match platform.find_open_mr(&batch.branch, &target).await? {
            Some(existing) => existing,
            None => {
                platform
                    .create_mr(
                        &batch.branch,
                        &target,
                        &comments::proof_title(&active),
                        &comments::proof_description(&active),
                        true,
                    )
                    .await?
            }
        };
        platform
            .add_label(proof.number, &self.ctx.settings.labels.batch_mr)
            .await?;
        batch.proof_mr = Some(proof.number);
        batch.proof_url = Some(proof.html_url.clone());
        platform.request_pipeline(proof.number).await?;
        self.transition(batch, BatchStatus::ProofPipelineWait)?;
        self.audit(batch, AuditAction::ProofOpened, Some(proof.html_url.clone()))?;
        info!(batch_id = %batch.id, proof_mr = proof.number, "proof MR opened");

        for key in &active {
            self.ctx
                .comment(key.number, &comments::batch_in_progress(proof.number))
                .await;
        }

        // ProofPipelineWait
        let poll = PollSettings {
            interval: self.ctx.settings.poll_interval,
            timeout: self.ctx.settings.proof_timeout,
        };
        let outcome = wait_for_pipeline(
            platform,
            proof.number,
            PipelineTarget::Proof,
            poll,
            self.cancel,
        )
        .await?;

        let failure = match outcome {
            PipelineOutcome::Success { .. } => None,
            PipelineOutcome::Failed(status) => {
                batch.pipeline_status = Some(status);
                Some(format!("Proof pipeline {status}"))
            }
            PipelineOutcome::TimedOut => Some("Proof pipeline timed out".to_string()),
            PipelineOutcome::NotOpen(state) => Some(format!("Proof MR is {state}")),
            PipelineOutcome::RebaseFailed(e) => Some(format!("Proof MR rebase failed: {e}")),
        };

        if let Some(reason) = failure {
            warn!(batch_id = %batch.id, %reason, "proof failed");
            self.transition(batch, BatchStatus::ProofFailed)?;
            self.audit(batch, AuditAction::ProofFailed, Some(reason.clone()))?;
            self.fail(batch, report, &reason).await?;
            return Ok(());
        }

        // ProofSuccess
        batch.pipeline_status = Some(crate::types::PipelineStatus::Success);
        self.transition(batch, BatchStatus::ProofSuccess)?;
        self.audit(batch, AuditAction::ProofPassed, None)?;
        info!(batch_id = %batch.id, "proof pipeline passed");
        for key in &active {
            let mut record = self.load_member(key)?;
            record.status = MrStatus::ReadyToFinalize;
            self.ctx.store.save_mr(&record)?;
            self.ctx
                .comment(key.number, &comments::batch_validated(proof.number))
                .await;
        }

        // FinalizingMembers
        self.transition(batch, BatchStatus::FinalizingMembers)?;
        let executor = self.ctx.executor();
        let context = MergeContext::Batch {
            proof_mr: proof.number,
        };
        for key in &active {
            let mut record = self.load_member(key)?;
            record.status = MrStatus::Merging;
            self.ctx.store.save_mr(&record)?;

            match executor.finalize(&mut record, context, self.cancel).await {
                Ok(FinalizeOutcome::Merged { sha }) => {
                    self.ctx.record_merged(&record, sha.as_deref())?;
                    report.merged.push(key.clone());
                }
                Ok(FinalizeOutcome::Failed(failure)) => {
                    if failure.counts_as_strike() {
                        report.failed.push(key.clone());
                    }
                    self.ctx.finalize_failed(&mut record, &failure).await?;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e @ Error::Store(_)) => return Err(e),
                Err(e) => {
                    self.ctx.finalize_errored(&mut record, &e).await?;
                    report.requeued.push(key.clone());
                }
            }
        }

        // Completed
        best_effort("batch teardown", teardown(platform, batch)).await;
        self.transition(batch, BatchStatus::Completed)?;
        self.ctx.store.archive_batch(batch)?;
        self.audit(
            batch,
            AuditAction::BatchCompleted,
            Some(format!(
                "{} merged, {} failed",
                report.merged.len(),
                report.failed.len()
            )),
        )?;
        info!(
            batch_id = %batch.id,
            merged = report.merged.len(),
            failed = report.failed.len(),
            "batch completed"
        );
        Ok(())
    }

    /// Systemic failure: no strikes, members requeued, remote state removed
    async fn fail(
        &self,
        batch: &mut BatchOperation,
        report: &mut BatchReport,
        reason: &str,
    ) -> Result<()> {
        warn!(batch_id = %batch.id, reason, "batch failed");
        for key in batch.active_members().cloned().collect::<Vec<_>>() {
            let Some(mut record) = self.ctx.store.load_mr(&key)? else {
                continue;
            };
            if record.batch_id != Some(batch.id) || !record.status.is_in_flight() {
                continue;
            }
            self.ctx.requeue(&mut record)?;
            self.ctx
                .comment(key.number, &comments::batch_failed(reason, batch.proof_mr))
                .await;
            report.requeued.push(key);
        }

        best_effort("batch teardown", teardown(self.ctx.platform.as_ref(), batch)).await;
        batch.error = Some(reason.to_string());
        self.transition(batch, BatchStatus::Failed)?;
        self.ctx.store.archive_batch(batch)?;
        report.error = Some(reason.to_string());
        self.audit(batch, AuditAction::BatchFailed, Some(reason.to_string()))
    }

    /// Drop a member during MergingMembers. Its strikes are untouched.
    async fn exclude(&self, batch: &mut BatchOperation, key: &MrKey, reason: &str) -> Result<()> {
        warn!(batch_id = %batch.id, mr = %key, reason, "member excluded from batch");
        batch.excluded.push(key.clone());
        self.ctx.store.save_batch(batch)?;

        let mut record = self.load_member(key)?;
        self.ctx.requeue(&mut record)?;
        self.ctx
            .comment(key.number, &comments::batch_excluded(reason))
            .await;
        self.ctx
            .audit_mr(&record, AuditAction::MemberExcluded, Some(reason.to_string()))
    }

    /// Tear down a batch left active by an earlier run and requeue its
    /// members (EFFECTFUL)
    pub async fn recover(&self, mut batch: BatchOperation) -> Result<()> {
        warn!(batch_id = %batch.id, status = %batch.status, "recovering interrupted batch");
        best_effort("batch teardown", teardown(self.ctx.platform.as_ref(), &batch)).await;

        for key in &batch.members {
            let Some(mut record) = self.ctx.store.load_mr(key)? else {
                continue;
            };
            if record.batch_id == Some(batch.id) && record.status.is_in_flight() {
                self.ctx.requeue(&mut record)?;
            }
        }

        let interrupted_at = batch.status;
        batch.error = Some("interrupted before completion".to_string());
        batch.transition(BatchStatus::Failed);
        self.ctx.store.archive_batch(&batch)?;
        self.audit(
            &batch,
            AuditAction::BatchRecovered,
            Some(format!("interrupted while {interrupted_at}")),
        )
    }

    fn transition(&self, batch: &mut BatchOperation, status: BatchStatus) -> Result<()> {
        info!(batch_id = %batch.id, from = %batch.status, to = %status, "batch transition");
        batch.transition(status);
        self.ctx.store.save_batch(batch)
    }

    fn audit(&self, batch: &BatchOperation, action: AuditAction, reason: Option<String>) -> Result<()> {
        self.ctx
            .store
            .audit(AuditSubject::Batch(batch.id), action, reason)
    }

    fn load_member(&self, key: &MrKey) -> Result<crate::types::MergeRequestRecord> {
        self.ctx
            .store
            .load_mr(key)?
            .ok_or_else(|| Error::Internal(format!("batch member {key} has no record")))
    }
}

fn member_list(members: &[MrKey]) -> String {
    members
        .iter()
        .map(|k| format!("!{}", k.number))
        .collect::<Vec<_>>()
        .join(", ")
}
