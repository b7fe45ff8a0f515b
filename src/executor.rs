//! Merge execution - rebase, wait for the pipeline, merge
//!
//! Shared by the single-merge path and batch finalization. The executor
//! reports what happened; whether a failure costs the MR a strike is the
//! caller's decision.

use crate::comments;
use crate::config::LaneSettings;
use crate::error::Result;
use crate::platform::PlatformService;
use crate::types::{MergeRequestRecord, MrStatus, PipelineStatus, PrState};
use crate::wait::{CancelToken, PollSettings, Probe, poll_until};
use chrono::Utc;
use std::future::Future;
use tracing::{debug, info, instrument, warn};

/// Why the merge is happening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeContext {
    /// The scheduler picked this MR on its own
    Single,
    /// Member of a validated batch
    Batch {
        /// Proof MR that validated the batch
        proof_mr: u64,
    },
}

impl MergeContext {
    /// Whether this is a batch member
    pub const fn is_batch(self) -> bool {
        matches!(self, Self::Batch { .. })
    }
}

/// What pipeline a wait is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineTarget {
    /// The MR's own head, possibly right after a rebase request
    MrHead {
        /// A rebase was requested; wait until it has landed
        rebase_requested: bool,
    },
    /// A proof MR. Skipped pipelines come from the `[skip ci]` member merges
    /// and are waited past.
    Proof,
}

/// How a pipeline wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Pipeline on the current head passed
    Success {
        /// Head the pipeline validated
        sha: String,
    },
    /// Pipeline finished without success
    Failed(PipelineStatus),
    /// Rebase reported an error
    RebaseFailed(String),
    /// MR was closed or merged while waiting
    NotOpen(PrState),
    /// Gave up waiting
    TimedOut,
}

/// Why a finalize did not merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeFailure {
    /// MR was already closed or merged
    NotOpen(PrState),
    /// MR now targets a different branch
    Retargeted(String),
    /// Rebase failed
    RebaseFailed(String),
    /// Pipeline after the rebase failed
    PipelineFailed(PipelineStatus),
    /// Pipeline did not finish in time
    PipelineTimedOut,
    /// Merge call refused
    MergeRefused(String),
}

impl FinalizeFailure {
    /// Failures caused by the MR's own content. A closed or retargeted MR
    /// is not one.
    pub const fn counts_as_strike(&self) -> bool {
        !matches!(self, Self::NotOpen(_) | Self::Retargeted(_))
    }
}

impl std::fmt::Display for FinalizeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotOpen(state) => write!(f, "MR is {state}"),
            Self::Retargeted(branch) => write!(f, "MR now targets {branch}"),
            Self::RebaseFailed(e) => write!(f, "Rebase failed: {e}"),
            Self::PipelineFailed(status) => write!(f, "Merge pipeline {status}"),
            Self::PipelineTimedOut => write!(f, "Merge pipeline timed out"),
            Self::MergeRefused(msg) => write!(f, "Merge refused: {msg}"),
        }
    }
}

/// Result of [`MergeExecutor::finalize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Merged into the target
    Merged {
        /// Merge commit, when reported
        sha: Option<String>,
    },
    /// Not merged
    Failed(FinalizeFailure),
}

/// Run a side effect whose failure must not change the outcome
pub(crate) async fn best_effort(what: &str, fut: impl Future<Output = Result<()>>) {
    if let Err(e) = fut.await {
        warn!(what, error = %e, "best-effort call failed");
    }
}

/// Poll an MR until its head pipeline reaches a verdict (EFFECTFUL)
pub async fn wait_for_pipeline(
    platform: &dyn PlatformService,
    number: u64,
    target: PipelineTarget,
    poll: PollSettings,
    cancel: &CancelToken,
) -> Result<PipelineOutcome> {
    let outcome = poll_until(poll, cancel, || async move {
        let snapshot = platform.get_mr_snapshot(number).await?;

        if snapshot.state != PrState::Open {
            return Ok(Probe::Ready(PipelineOutcome::NotOpen(snapshot.state)));
        }

        if let PipelineTarget::MrHead { rebase_requested } = target {
            if let Some(error) = snapshot.rebase_error {
                return Ok(Probe::Ready(PipelineOutcome::RebaseFailed(error)));
            }
            if snapshot.rebase_in_progress || (rebase_requested && snapshot.behind_target) {
                debug!(mr = number, "rebase still in progress");
                return Ok(Probe::Pending);
            }
        }

        let Some(pipeline) = snapshot.pipeline else {
            debug!(mr = number, "no pipeline yet");
            return Ok(Probe::Pending);
        };
        if pipeline.sha != snapshot.head_sha {
            debug!(mr = number, "pipeline belongs to an older head");
            return Ok(Probe::Pending);
        }

        Ok(match pipeline.status {
            PipelineStatus::Success => Probe::Ready(PipelineOutcome::Success {
                sha: snapshot.head_sha,
            }),
            status if status.is_running() => Probe::Pending,
            PipelineStatus::Skipped if target == PipelineTarget::Proof => Probe::Pending,
            status => Probe::Ready(PipelineOutcome::Failed(status)),
        })
    })
    .await?;

    Ok(outcome.unwrap_or(PipelineOutcome::TimedOut))
}

/// Rebase, wait for the pipeline, merge
pub struct MergeExecutor<'a> {
    platform: &'a dyn PlatformService,
    settings: &'a LaneSettings,
}

impl<'a> MergeExecutor<'a> {
    /// Create an executor for one lane
    pub const fn new(platform: &'a dyn PlatformService, settings: &'a LaneSettings) -> Self {
        Self { platform, settings }
    }

    /// Finalize one MR (EFFECTFUL).
    ///
    /// On success the record is marked Merged. On failure the record is left
    /// as it was and an explanatory comment is posted. `Err` means the remote
    /// stayed unreachable after retries, or the wait was cancelled.
    #[instrument(skip_all, fields(mr = %record.key))]
    pub async fn finalize(
        &self,
        record: &mut MergeRequestRecord,
        context: MergeContext,
        cancel: &CancelToken,
    ) -> Result<FinalizeOutcome> {
        let number = record.key.number;
        let snapshot = self.platform.get_mr_snapshot(number).await?;
        if snapshot.state != PrState::Open {
            info!(state = %snapshot.state, "MR no longer open");
            return Ok(FinalizeOutcome::Failed(FinalizeFailure::NotOpen(
                snapshot.state,
            )));
        }

        if snapshot.target_branch != record.target_branch {
            info!(target = %snapshot.target_branch, "MR was retargeted");
            return Ok(FinalizeOutcome::Failed(FinalizeFailure::Retargeted(
                snapshot.target_branch,
            )));
        }

        let rebase_requested = snapshot.behind_target;
        if rebase_requested {
            info!(target = %snapshot.target_branch, "rebasing onto target");
            self.platform.rebase_mr(number).await?;
        }

        let poll = PollSettings {
            interval: self.settings.poll_interval,
            timeout: self.settings.pipeline_timeout,
        };
        let outcome = wait_for_pipeline(
            self.platform,
            number,
            PipelineTarget::MrHead { rebase_requested },
            poll,
            cancel,
        )
        .await?;

        let sha = match outcome {
            PipelineOutcome::Success { sha } => sha,
            PipelineOutcome::NotOpen(state) => {
                return Ok(FinalizeOutcome::Failed(FinalizeFailure::NotOpen(state)));
            }
            PipelineOutcome::RebaseFailed(error) => {
                warn!(%error, "rebase failed");
                best_effort(
                    "rebase failure comment",
                    self.platform.add_comment(number, &comments::rebase_failed(&error)),
                )
                .await;
                return Ok(FinalizeOutcome::Failed(FinalizeFailure::RebaseFailed(error)));
            }
            PipelineOutcome::Failed(status) => {
                warn!(%status, "merge pipeline failed");
                best_effort(
                    "pipeline failure comment",
                    self.platform
                        .add_comment(number, &comments::pipeline_failed(Some(status), false)),
                )
                .await;
                return Ok(FinalizeOutcome::Failed(FinalizeFailure::PipelineFailed(status)));
            }
            PipelineOutcome::TimedOut => {
                warn!(timeout_secs = poll.timeout.as_secs(), "merge pipeline timed out");
                best_effort(
                    "pipeline timeout comment",
                    self.platform
                        .add_comment(number, &comments::pipeline_failed(None, true)),
                )
                .await;
                return Ok(FinalizeOutcome::Failed(FinalizeFailure::PipelineTimedOut));
            }
        };

        let result = self
            .platform
            .merge_mr(number, self.settings.merge_method, Some(&sha))
            .await?;

        if !result.merged {
            let message = result
                .message
                .unwrap_or_else(|| "merge was not performed".to_string());
            warn!(%message, "merge refused");
            best_effort(
                "merge refused comment",
                self.platform
                    .add_comment(number, &comments::merge_refused(&message)),
            )
            .await;
            return Ok(FinalizeOutcome::Failed(FinalizeFailure::MergeRefused(message)));
        }

        record.status = MrStatus::Merged;
        record.merged_at = Some(Utc::now());
        record.batch_id = None;
        info!(sha = ?result.sha, batch = context.is_batch(), "merged");

        best_effort(
            "merged comment",
            self.platform
                .add_comment(number, &comments::merged(context.is_batch())),
        )
        .await;
        let labels = &self.settings.labels;
        for label in [&labels.ready_to_merge, &labels.recognized, &labels.not_ready] {
            best_effort("label removal", self.platform.remove_label(number, label)).await;
        }

        Ok(FinalizeOutcome::Merged { sha: result.sha })
    }
}
