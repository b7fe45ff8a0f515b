//! Readiness validation - pure verdicts from MR snapshots
//!
//! Every check runs; every failing check contributes a reason. No I/O.

use crate::types::{MrSnapshot, PipelineStatus};
use regex::Regex;
use std::sync::LazyLock;

/// Title prefixes that mark work in progress
static WIP_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(wip:|\[wip\]|draft:)").unwrap_or_else(|e| panic!("bad WIP regex: {e}"))
});

/// Why an MR is not ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReadyReason {
    /// WIP/Draft title or draft flag
    WorkInProgress,
    /// No pipeline at all
    PipelineMissing,
    /// Pipeline exists but has not finished
    PipelineRunning(PipelineStatus),
    /// Pipeline finished without success
    PipelineFailed(PipelineStatus),
    /// Latest pipeline belongs to an older head commit
    PipelineStale {
        /// Commit the pipeline ran on
        pipeline_sha: String,
        /// Current head
        head_sha: String,
    },
    /// Approval rules not satisfied
    NotApproved,
    /// Not assigned to the automation account
    NotAssigned {
        /// Automation username
        expected: String,
    },
    /// Conflicts with the target branch
    HasConflicts,
    /// Blocking discussions still open
    UnresolvedDiscussions,
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkInProgress => write!(f, "MR is WIP/Draft"),
            Self::PipelineMissing => write!(f, "No pipeline found"),
            Self::PipelineRunning(status) => write!(f, "Pipeline still {status}"),
            Self::PipelineFailed(status) => write!(f, "Pipeline {status}"),
            Self::PipelineStale {
                pipeline_sha,
                head_sha,
            } => write!(
                f,
                "Pipeline is for {} but the head is {}",
                short_sha(pipeline_sha),
                short_sha(head_sha)
            ),
            Self::NotApproved => write!(f, "Required approvals missing"),
            Self::NotAssigned { expected } => write!(f, "Not assigned to {expected}"),
            Self::HasConflicts => write!(f, "MR has conflicts"),
            Self::UnresolvedDiscussions => write!(f, "Blocking discussions not resolved"),
        }
    }
}

/// Validator output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// All checks passed
    Ready,
    /// At least one check failed
    NotReady(Vec<NotReadyReason>),
}

impl Verdict {
    /// Whether all checks passed
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Failing reasons (empty when ready)
    pub fn reasons(&self) -> &[NotReadyReason] {
        match self {
            Self::Ready => &[],
            Self::NotReady(reasons) => reasons,
        }
    }

    /// Reasons rendered for comments and records
    pub fn reason_strings(&self) -> Vec<String> {
        self.reasons().iter().map(ToString::to_string).collect()
    }
}

/// Whether a title marks the MR as work in progress
pub fn is_wip_title(title: &str) -> bool {
    WIP_TITLE.is_match(title)
}

/// Evaluate a snapshot.
///
/// `automation_user` is the account MRs are handed to for merging.
pub fn validate(snapshot: &MrSnapshot, automation_user: &str) -> Verdict {
    let mut reasons = Vec::new();

    if snapshot.is_draft || is_wip_title(&snapshot.title) {
        reasons.push(NotReadyReason::WorkInProgress);
    }

    if let Some(reason) = check_pipeline(snapshot) {
        reasons.push(reason);
    }

    if !snapshot.approvals_satisfied {
        reasons.push(NotReadyReason::NotApproved);
    }

    if !snapshot.assignees.iter().any(|a| a == automation_user) {
        reasons.push(NotReadyReason::NotAssigned {
            expected: automation_user.to_string(),
        });
    }

    if snapshot.has_conflicts {
        reasons.push(NotReadyReason::HasConflicts);
    }

    if snapshot.unresolved_discussions {
        reasons.push(NotReadyReason::UnresolvedDiscussions);
    }

    if reasons.is_empty() {
        Verdict::Ready
    } else {
        Verdict::NotReady(reasons)
    }
}

fn check_pipeline(snapshot: &MrSnapshot) -> Option<NotReadyReason> {
    let Some(pipeline) = &snapshot.pipeline else {
        return Some(NotReadyReason::PipelineMissing);
    };

    if pipeline.sha != snapshot.head_sha {
        return Some(NotReadyReason::PipelineStale {
            pipeline_sha: pipeline.sha.clone(),
            head_sha: snapshot.head_sha.clone(),
        });
    }

    match pipeline.status {
        PipelineStatus::Success => None,
        status if status.is_running() => Some(NotReadyReason::PipelineRunning(status)),
        status => Some(NotReadyReason::PipelineFailed(status)),
    }
}
