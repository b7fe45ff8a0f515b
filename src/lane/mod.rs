//! Lanes - one serialized worker per (project, target branch)
//!
//! A lane owns every record targeting its branch. Commands (evaluations,
//! reinstatements) and scheduler cycles run strictly one at a time inside the
//! lane's task, which is what keeps a lane to a single in-flight operation.

mod context;

pub use context::LaneContext;

use crate::batch::BatchManager;
use crate::comments;
use crate::error::{Error, Result};
use crate::executor::{FinalizeOutcome, MergeContext};
use crate::readiness;
use crate::scheduler::{CycleDecision, plan_cycle};
use crate::store::Store;
use crate::strikes::StrikeOutcome;
use crate::types::{
    AuditAction, AuditSubject, MergeRequestRecord, MrKey, MrSnapshot, MrStatus, PrState,
};
use crate::wait::CancelToken;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// MRs with an evaluation waiting in a lane's channel
pub type PendingSet = Arc<Mutex<HashSet<MrKey>>>;

/// Work sent to a lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneCommand {
    /// Re-run the validator for an MR
    Evaluate(MrKey),
    /// Operator cleared a rejection
    Reinstate(MrKey),
}

/// What an evaluation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Nothing to do (terminal, in flight, proof MR, or other lane)
    Skipped,
    /// MR was closed or merged outside the engine and got archived
    Closed,
    /// Verdict applied
    Verdict(StrikeOutcome),
}

/// Move a rejected record back to `Recognized` with no strikes.
///
/// Touches only the store, so it also works without a running engine.
pub fn reinstate_record(store: &dyn Store, key: &MrKey) -> Result<MergeRequestRecord> {
    let mut record = store
        .load_mr(key)?
        .ok_or_else(|| Error::NotFound(format!("no record for {key}")))?;
    if record.status != MrStatus::Rejected {
        return Err(Error::InvalidState(format!(
            "{key} is {}, only rejected MRs can be reinstated",
            record.status
        )));
    }

    record.status = MrStatus::Recognized;
    record.strikes = 0;
    record.last_reasons.clear();
    record.queued_at = None;
    record.batch_id = None;
    store.save_mr(&record)?;
    store.audit(
        AuditSubject::Mr(key.clone()),
        AuditAction::Reinstated,
        None,
    )?;
    info!(mr = %key, "MR reinstated");
    Ok(record)
}

/// A lane worker
pub struct Lane {
    ctx: LaneContext,
    cancel: CancelToken,
    halted: Option<String>,
}

impl Lane {
    /// Create a lane; nothing runs until [`Lane::run`] or explicit calls
    pub const fn new(ctx: LaneContext, cancel: CancelToken) -> Self {
        Self {
            ctx,
            cancel,
            halted: None,
        }
    }

    /// Lane dependencies
    pub const fn context(&self) -> &LaneContext {
        &self.ctx
    }

    /// Halt reason, when the lane stopped on a configuration error
    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Whether the lane stopped on a configuration error
    pub const fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Stop processing commands until restart
    pub fn halt(&mut self, reason: &str) {
        error!(lane = %self.ctx.key, reason, "lane halted");
        self.halted = Some(reason.to_string());
        if let Err(e) = self.ctx.store.audit(
            AuditSubject::Lane(self.ctx.key.clone()),
            AuditAction::LaneHalted,
            Some(reason.to_string()),
        ) {
            warn!(lane = %self.ctx.key, error = %e, "failed to audit lane halt");
        }
    }

    /// Preflight and crash recovery (EFFECTFUL).
    ///
    /// A missing target branch halts the lane. Otherwise leftovers from an
    /// interrupted run are torn down and requeued.
    #[instrument(skip_all, fields(lane = %self.ctx.key))]
    pub async fn startup(&mut self) -> Result<()> {
        match self.ctx.platform.branch_exists(&self.ctx.key.target_branch).await {
            Ok(true) => {}
            Ok(false) => {
                let reason = format!(
                    "target branch {} does not exist",
                    self.ctx.key.target_branch
                );
                self.halt(&reason);
                return Ok(());
            }
            Err(e) if e.is_configuration() => {
                self.halt(&e.to_string());
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.recover().await
    }

    /// Tear down a batch left active by an earlier run and requeue
    /// in-flight records (EFFECTFUL)
    pub async fn recover(&self) -> Result<()> {
        if let Some(batch) = self.ctx.store.active_batch(&self.ctx.key)? {
            BatchManager::new(&self.ctx, &self.cancel)
                .recover(batch)
                .await?;
        }

        for mut record in self.ctx.store.lane_mrs(&self.ctx.key)? {
            if record.status.is_in_flight() {
                info!(mr = %record.key, status = %record.status, "requeueing interrupted MR");
                self.ctx.requeue(&mut record)?;
            }
        }
        Ok(())
    }

    /// Fetch an MR and apply the validator verdict (EFFECTFUL)
    #[instrument(skip_all, fields(lane = %self.ctx.key, mr = %key))]
    pub async fn evaluate(&self, key: &MrKey) -> Result<Evaluation> {
        let snapshot = self.ctx.platform.get_mr_snapshot(key.number).await?;
        let existing = self.ctx.store.load_mr(key)?;

        if self.is_batch_mr(&snapshot) {
            debug!("ignoring batch branch MR");
            return Ok(Evaluation::Skipped);
        }

        let mut record = match existing {
            Some(record) if record.status.is_in_flight() => {
                debug!(status = %record.status, "owned by a running operation");
                return Ok(Evaluation::Skipped);
            }
            Some(record)
                if record.status == MrStatus::Closed
                    && snapshot.state == PrState::Open
                    && snapshot.target_branch == self.ctx.key.target_branch =>
            {
                info!(target = %snapshot.target_branch, "closed MR is open again");
                self.recognize(&snapshot).await?
            }
            Some(record) if record.status.is_terminal() => {
                debug!(status = %record.status, "terminal record");
                return Ok(Evaluation::Skipped);
            }
            Some(mut record) => {
                if snapshot.state != PrState::Open {
                    self.ctx
                        .archive_closed(&mut record, &format!("MR is {}", snapshot.state))?;
                    return Ok(Evaluation::Closed);
                }
                if snapshot.target_branch != self.ctx.key.target_branch {
                    let reason = format!("retargeted to {}", snapshot.target_branch);
                    self.ctx.archive_closed(&mut record, &reason)?;
                    return Ok(Evaluation::Closed);
                }
                record.refresh(&snapshot);
                record
            }
            None => {
                if snapshot.state != PrState::Open
                    || snapshot.target_branch != self.ctx.key.target_branch
                {
                    return Ok(Evaluation::Skipped);
                }
                self.recognize(&snapshot).await?
            }
        };

        let verdict = readiness::validate(&snapshot, &self.ctx.settings.automation_user);
        let outcome = self.ctx.strikes.record_verdict(&mut record, &verdict);
        let labels = &self.ctx.settings.labels;

        match outcome {
            StrikeOutcome::Cleared { newly_queued } => {
                self.ctx.store.save_mr(&record)?;
                if newly_queued {
                    info!("MR queued");
                    self.ctx
                        .relabel(
                            key.number,
                            Some(labels.ready_to_merge.as_str()),
                            &[labels.not_ready.as_str(), labels.rejected.as_str()],
                        )
                        .await;
                    self.ctx.audit_mr(&record, AuditAction::Queued, None)?;
                }
            }
            StrikeOutcome::Struck { count } => {
                info!(strikes = count, reasons = ?record.last_reasons, "MR not ready");
                self.ctx.store.save_mr(&record)?;
                self.ctx
                    .relabel(
                        key.number,
                        Some(labels.not_ready.as_str()),
                        &[labels.ready_to_merge.as_str(), labels.rejected.as_str()],
                    )
                    .await;
                self.ctx
                    .comment(
                        key.number,
                        &comments::not_ready(
                            &record.last_reasons,
                            count,
                            self.ctx.strikes.threshold(),
                        ),
                    )
                    .await;
                self.ctx.audit_mr(
                    &record,
                    AuditAction::NotReady,
                    Some(record.last_reasons.join("; ")),
                )?;
            }
            StrikeOutcome::Rejected { .. } => self.ctx.reject(&mut record).await?,
            StrikeOutcome::Ignored => {}
        }
        Ok(Evaluation::Verdict(outcome))
    }

    fn is_batch_mr(&self, snapshot: &MrSnapshot) -> bool {
        snapshot.source_branch == self.ctx.batch_branch()
            || snapshot
                .labels
                .iter()
                .any(|l| *l == self.ctx.settings.labels.batch_mr)
    }

    async fn recognize(&self, snapshot: &MrSnapshot) -> Result<MergeRequestRecord> {
        let record = MergeRequestRecord::recognize(&self.ctx.key.project, snapshot, Utc::now());
        info!(title = %record.title, "MR recognized");
        self.ctx.store.save_mr(&record)?;
        self.ctx.audit_mr(&record, AuditAction::Recognized, None)?;
        self.ctx
            .relabel(
                snapshot.number,
                Some(self.ctx.settings.labels.recognized.as_str()),
                &[],
            )
            .await;
        Ok(record)
    }

    /// Plan one scheduler cycle and execute it (EFFECTFUL)
    #[instrument(skip_all, fields(lane = %self.ctx.key))]
    pub async fn run_cycle(&self) -> Result<CycleDecision> {
        if self.is_halted() {
            return Ok(CycleDecision::Idle);
        }

        let records = self.ctx.store.lane_mrs(&self.ctx.key)?;
        let busy = self.ctx.store.active_batch(&self.ctx.key)?.is_some()
            || records.iter().any(|r| r.status.is_in_flight());
        let queued: Vec<MergeRequestRecord> = records
            .into_iter()
            .filter(|r| r.status == MrStatus::Queued)
            .collect();

        let decision = plan_cycle(&queued, busy, Utc::now(), &self.ctx.schedule_policy());
        match &decision {
            CycleDecision::Idle => {}
            CycleDecision::Wait { .. } => debug!(%decision, "partial queue"),
            CycleDecision::Single(key) => {
                info!(%decision, "scheduling");
                self.merge_single(key).await?;
            }
            CycleDecision::Batch(members) => {
                info!(%decision, "scheduling");
                let report = BatchManager::new(&self.ctx, &self.cancel)
                    .run(members.clone())
                    .await?;
                info!(
                    batch_id = %report.batch_id,
                    status = %report.status,
                    merged = report.merged.len(),
                    "batch finished"
                );
            }
        }
        Ok(decision)
    }

    /// Run cycles until the lane has nothing left to start right now.
    ///
    /// Stops early when a cycle leaves the queue no shorter, so a remote that
    /// keeps failing is retried on the next tick instead of in a tight loop.
    pub async fn drain(&self) -> Result<()> {
        loop {
            let before = self.queued_count()?;
            match self.run_cycle().await? {
                CycleDecision::Single(_) | CycleDecision::Batch(_) => {}
                CycleDecision::Idle | CycleDecision::Wait { .. } => return Ok(()),
            }
            if self.queued_count()? >= before {
                return Ok(());
            }
        }
    }

    fn queued_count(&self) -> Result<usize> {
        Ok(self
            .ctx
            .store
            .lane_mrs(&self.ctx.key)?
            .iter()
            .filter(|r| r.status == MrStatus::Queued)
            .count())
    }

    /// Merge one queued MR through the executor (EFFECTFUL)
    pub async fn merge_single(&self, key: &MrKey) -> Result<()> {
        let mut record = self
            .ctx
            .store
            .load_mr(key)?
            .ok_or_else(|| Error::Internal(format!("scheduled MR {key} has no record")))?;
        record.status = MrStatus::Merging;
        self.ctx.store.save_mr(&record)?;

        match self
            .ctx
            .executor()
            .finalize(&mut record, MergeContext::Single, &self.cancel)
            .await
        {
            Ok(FinalizeOutcome::Merged { sha }) => self.ctx.record_merged(&record, sha.as_deref()),
            Ok(FinalizeOutcome::Failed(failure)) => {
                self.ctx.finalize_failed(&mut record, &failure).await?;
                Ok(())
            }
            Err(Error::Cancelled) => {
                self.ctx.requeue(&mut record)?;
                Err(Error::Cancelled)
            }
            Err(e @ Error::Store(_)) => Err(e),
            Err(e) => self.ctx.finalize_errored(&mut record, &e).await,
        }
    }

    /// Clear a rejection and re-evaluate (EFFECTFUL)
    pub async fn reinstate(&self, key: &MrKey) -> Result<Evaluation> {
        reinstate_record(self.ctx.store.as_ref(), key)?;
        let labels = &self.ctx.settings.labels;
        self.ctx
            .relabel(
                key.number,
                Some(labels.recognized.as_str()),
                &[labels.rejected.as_str()],
            )
            .await;
        self.evaluate(key).await
    }

    async fn handle(&mut self, command: LaneCommand, pending: &PendingSet) -> Result<()> {
        if self.is_halted() {
            debug!(lane = %self.ctx.key, ?command, "lane halted, ignoring command");
            if let LaneCommand::Evaluate(key) = &command {
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(key);
            }
            return Ok(());
        }

        match command {
            LaneCommand::Evaluate(key) => {
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
                self.evaluate(&key).await?;
            }
            LaneCommand::Reinstate(key) => {
                self.reinstate(&key).await?;
            }
        }
        Ok(())
    }

    /// Log a failure; returns true when the lane should stop
    fn absorb(&mut self, what: &str, error: Error) -> bool {
        match error {
            Error::Cancelled => true,
            e if e.is_configuration() => {
                self.halt(&e.to_string());
                false
            }
            e => {
                warn!(lane = %self.ctx.key, what, error = %e, "lane operation failed");
                false
            }
        }
    }

    /// Actor loop: commands, then scheduler cycles, until shutdown or the
    /// channel closes
    #[instrument(skip_all, fields(lane = %self.ctx.key))]
    pub async fn run(mut self, mut commands: mpsc::Receiver<LaneCommand>, pending: PendingSet) {
        if let Err(e) = self.startup().await {
            if self.absorb("startup", e) {
                return;
            }
        }

        let mut tick = tokio::time::interval(self.ctx.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let mut batch = vec![command];
                    // Drain what is already waiting so bursts land in one cycle
                    while let Ok(next) = commands.try_recv() {
                        batch.push(next);
                    }
                    let mut stop = false;
                    for command in batch {
                        if let Err(e) = self.handle(command, &pending).await {
                            stop |= self.absorb("command", e);
                        }
                    }
                    if stop {
                        break;
                    }
                }
                _ = tick.tick() => {}
            }

            if self.is_halted() {
                continue;
            }
            if let Err(e) = self.drain().await {
                if self.absorb("scheduler cycle", e) {
                    break;
                }
            }
        }
        info!(lane = %self.ctx.key, "lane stopped");
    }
}
