//! Core types for merge-assist

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a merge request: project path plus the platform's MR number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MrKey {
    /// Project path (e.g. "group/app")
    pub project: String,
    /// MR/PR number within the project (GitLab iid, GitHub number)
    pub number: u64,
}

impl MrKey {
    /// Create a new key
    pub fn new(project: impl Into<String>, number: u64) -> Self {
        Self {
            project: project.into(),
            number,
        }
    }
}

impl std::fmt::Display for MrKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}!{}", self.project, self.number)
    }
}

/// A serialized orchestration unit: one (project, target branch) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LaneKey {
    /// Project path
    pub project: String,
    /// Target branch all MRs in this lane merge into
    pub target_branch: String,
}

impl LaneKey {
    /// Create a new lane key
    pub fn new(project: impl Into<String>, target_branch: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            target_branch: target_branch.into(),
        }
    }
}

impl std::fmt::Display for LaneKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.project, self.target_branch)
    }
}

/// A discovery signal: "this MR needs evaluation"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MrEvent {
    /// Project path
    pub project: String,
    /// MR number
    pub mr: u64,
}

impl MrEvent {
    /// Key of the MR this event refers to
    pub fn key(&self) -> MrKey {
        MrKey::new(self.project.clone(), self.mr)
    }
}

/// A pull request / merge request as returned by create/find calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    /// PR/MR number
    pub number: u64,
    /// Web URL for the PR/MR
    pub html_url: String,
    /// Base branch name
    pub base_ref: String,
    /// Head branch name
    pub head_ref: String,
    /// PR/MR title
    pub title: String,
    /// GraphQL node ID (GitHub only, used for mutations)
    pub node_id: Option<String>,
    /// Whether PR is a draft
    pub is_draft: bool,
}

/// Detected platform type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// GitHub or GitHub Enterprise
    GitHub,
    /// GitLab or self-hosted GitLab
    GitLab,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GitHub => write!(f, "GitHub"),
            Self::GitLab => write!(f, "GitLab"),
        }
    }
}

/// Platform configuration
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Platform type
    pub platform: Platform,
    /// Repository owner (user, group or organization)
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Custom host (None for github.com/gitlab.com)
    pub host: Option<String>,
}

impl PlatformConfig {
    /// Project path used as the project half of every key
    pub fn project_path(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// PR state (open, closed, merged)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrState {
    /// PR is open and can be merged
    Open,
    /// PR was closed without merging
    Closed,
    /// PR was merged
    Merged,
}

impl std::fmt::Display for PrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// Status of a CI pipeline, normalized across platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created but not yet scheduled
    Created,
    /// Waiting for a runner or resource
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Success,
    /// Finished with failures
    Failed,
    /// Cancelled before completion
    Canceled,
    /// Skipped entirely
    Skipped,
    /// Blocked on a manual action
    Manual,
}

impl PipelineStatus {
    /// Parse a GitLab-style status string.
    ///
    /// Unknown statuses are treated as pending so waits keep polling.
    pub fn from_gitlab(status: &str) -> Self {
        match status {
            "created" => Self::Created,
            "running" => Self::Running,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            "skipped" => Self::Skipped,
            "manual" => Self::Manual,
            // waiting_for_resource, preparing, pending, scheduled
            _ => Self::Pending,
        }
    }

    /// Still in progress
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Created | Self::Pending | Self::Running)
    }

    /// Finished successfully
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Skipped => "skipped",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// The pipeline attached to an MR's head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInfo {
    /// Platform pipeline ID (0 when the platform aggregates check runs)
    pub id: u64,
    /// Normalized status
    pub status: PipelineStatus,
    /// Commit the pipeline ran against
    pub sha: String,
}

/// Point-in-time view of an MR, everything the validator and executor need
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct MrSnapshot {
    /// MR number
    pub number: u64,
    /// MR title
    pub title: String,
    /// Web URL
    pub web_url: String,
    /// Open / closed / merged
    pub state: PrState,
    /// Explicit draft flag
    pub is_draft: bool,
    /// Source branch
    pub source_branch: String,
    /// Target branch
    pub target_branch: String,
    /// Current head commit
    pub head_sha: String,
    /// Latest pipeline (may belong to an older head)
    pub pipeline: Option<PipelineInfo>,
    /// Required approvals satisfied
    pub approvals_satisfied: bool,
    /// Assignee usernames
    pub assignees: Vec<String>,
    /// Merge conflicts with the target
    pub has_conflicts: bool,
    /// Unresolved blocking discussions
    pub unresolved_discussions: bool,
    /// Source branch lacks commits from the target head
    pub behind_target: bool,
    /// A rebase was requested and has not finished yet
    pub rebase_in_progress: bool,
    /// Error reported by the last rebase attempt, if any
    pub rebase_error: Option<String>,
    /// Labels currently on the MR
    pub labels: Vec<String>,
}

/// Lifecycle of an MR inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrStatus {
    /// Seen but not yet evaluated to a verdict
    Recognized,
    /// Last verdict was NotReady
    NotReady,
    /// Ready and waiting for the scheduler
    Queued,
    /// Member of an active batch, before the proof verdict
    InBatch,
    /// Proof pipeline passed, waiting for individual finalize
    ReadyToFinalize,
    /// Executor is rebasing / waiting / merging it
    Merging,
    /// Merged by the engine
    Merged,
    /// Struck out; needs operator action
    Rejected,
    /// Closed or merged outside the engine
    Closed,
}

impl MrStatus {
    /// Terminal states are archived and ignored by evaluation
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Rejected | Self::Closed)
    }

    /// Owned by a running single merge or batch
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::InBatch | Self::ReadyToFinalize | Self::Merging)
    }
}

impl std::fmt::Display for MrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Recognized => "recognized",
            Self::NotReady => "not ready",
            Self::Queued => "queued",
            Self::InBatch => "in batch",
            Self::ReadyToFinalize => "ready to finalize",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Engine-owned record of an MR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequestRecord {
    /// Identity
    pub key: MrKey,
    /// Title at last evaluation
    pub title: String,
    /// Web URL
    #[serde(default)]
    pub web_url: String,
    /// Source branch
    pub source_branch: String,
    /// Target branch (selects the lane)
    pub target_branch: String,
    /// Lifecycle status
    pub status: MrStatus,
    /// Consecutive readiness failures
    pub strikes: u32,
    /// Scheduling priority, higher first
    #[serde(default)]
    pub priority: i32,
    /// Assignee at last evaluation
    pub assignee: Option<String>,
    /// First time the engine saw this MR
    pub recognized_at: DateTime<Utc>,
    /// When it last entered the ready queue
    pub queued_at: Option<DateTime<Utc>>,
    /// Pipeline status at last evaluation
    pub last_pipeline_status: Option<PipelineStatus>,
    /// Reasons from the last NotReady verdict
    #[serde(default)]
    pub last_reasons: Vec<String>,
    /// When the engine merged it
    pub merged_at: Option<DateTime<Utc>>,
    /// Active batch this MR belongs to
    pub batch_id: Option<Uuid>,
}

impl MergeRequestRecord {
    /// Create a freshly recognized record from a snapshot
    pub fn recognize(project: &str, snapshot: &MrSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            key: MrKey::new(project, snapshot.number),
            title: snapshot.title.clone(),
            web_url: snapshot.web_url.clone(),
            source_branch: snapshot.source_branch.clone(),
            target_branch: snapshot.target_branch.clone(),
            status: MrStatus::Recognized,
            strikes: 0,
            priority: 0,
            assignee: snapshot.assignees.first().cloned(),
            recognized_at: now,
            queued_at: None,
            last_pipeline_status: snapshot.pipeline.as_ref().map(|p| p.status),
            last_reasons: Vec::new(),
            merged_at: None,
            batch_id: None,
        }
    }

    /// Refresh the descriptive fields from a new snapshot
    pub fn refresh(&mut self, snapshot: &MrSnapshot) {
        self.title.clone_from(&snapshot.title);
        self.web_url.clone_from(&snapshot.web_url);
        self.source_branch.clone_from(&snapshot.source_branch);
        self.target_branch.clone_from(&snapshot.target_branch);
        self.assignee = snapshot.assignees.first().cloned();
        self.last_pipeline_status = snapshot.pipeline.as_ref().map(|p| p.status);
    }

    /// Lane this record belongs to
    pub fn lane(&self) -> LaneKey {
        LaneKey::new(self.key.project.clone(), self.target_branch.clone())
    }

    /// Start of the current wait in the queue, for the partial-batch delay.
    /// Queue order itself is by `recognized_at`.
    pub fn waiting_since(&self) -> DateTime<Utc> {
        self.queued_at.unwrap_or(self.recognized_at)
    }
}

/// State machine of a batch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Resetting the batch branch
    Creating,
    /// Merging member source branches into the batch branch
    MergingMembers,
    /// Opening the proof MR
    ProofPending,
    /// Polling the proof pipeline
    ProofPipelineWait,
    /// Proof pipeline passed
    ProofSuccess,
    /// Proof pipeline failed or timed out
    ProofFailed,
    /// Merging members individually
    FinalizingMembers,
    /// Done, cleaned up
    Completed,
    /// Systemic failure, cleaned up
    Failed,
}

impl BatchStatus {
    /// Completed or Failed
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::MergingMembers => "merging members",
            Self::ProofPending => "proof pending",
            Self::ProofPipelineWait => "waiting for proof pipeline",
            Self::ProofSuccess => "proof succeeded",
            Self::ProofFailed => "proof failed",
            Self::FinalizingMembers => "finalizing members",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A coordinated merge of several MRs validated by one proof pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    /// Identity
    pub id: Uuid,
    /// Lane this batch runs in
    pub lane: LaneKey,
    /// Ephemeral integration branch
    pub branch: String,
    /// Proof MR number once opened
    pub proof_mr: Option<u64>,
    /// Proof MR web URL
    pub proof_url: Option<String>,
    /// Members in scheduler order
    pub members: Vec<MrKey>,
    /// Members dropped during MergingMembers
    #[serde(default)]
    pub excluded: Vec<MrKey>,
    /// Current state
    pub status: BatchStatus,
    /// Proof pipeline status
    pub pipeline_status: Option<PipelineStatus>,
    /// Failure description
    pub error: Option<String>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Last transition
    pub updated_at: DateTime<Utc>,
    /// Terminal transition time
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchOperation {
    /// Start a new batch in the Creating state
    pub fn new(lane: LaneKey, branch: String, members: Vec<MrKey>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lane,
            branch,
            proof_mr: None,
            proof_url: None,
            members,
            excluded: Vec::new(),
            status: BatchStatus::Creating,
            pipeline_status: None,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to a new state, stamping timestamps
    pub fn transition(&mut self, status: BatchStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    /// Members still participating (not excluded)
    pub fn active_members(&self) -> impl Iterator<Item = &MrKey> {
        self.members.iter().filter(|m| !self.excluded.contains(m))
    }
}

/// What an audit entry is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum AuditSubject {
    /// A merge request
    Mr(MrKey),
    /// A batch operation
    Batch(Uuid),
    /// A lane as a whole
    Lane(LaneKey),
}

impl std::fmt::Display for AuditSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mr(key) => write!(f, "{key}"),
            Self::Batch(id) => write!(f, "batch {id}"),
            Self::Lane(lane) => write!(f, "lane {lane}"),
        }
    }
}

/// Audited actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// First evaluation
    Recognized,
    /// Verdict was NotReady (strike recorded)
    NotReady,
    /// Verdict was Ready (queued)
    Queued,
    /// Struck out
    Rejected,
    /// Operator cleared a rejection
    Reinstated,
    /// Closed or merged outside the engine
    Closed,
    /// Executor merged the MR
    Merged,
    /// Executor could not merge the MR
    MergeFailed,
    /// Batch created
    BatchStarted,
    /// Member dropped from a batch
    MemberExcluded,
    /// Proof MR opened
    ProofOpened,
    /// Proof pipeline passed
    ProofPassed,
    /// Proof pipeline failed / timed out
    ProofFailed,
    /// Batch finished
    BatchCompleted,
    /// Batch failed systemically
    BatchFailed,
    /// Leftover batch from an earlier run torn down
    BatchRecovered,
    /// Lane stopped on configuration error
    LaneHalted,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Recognized => "recognized",
            Self::NotReady => "not_ready",
            Self::Queued => "queued",
            Self::Rejected => "rejected",
            Self::Reinstated => "reinstated",
            Self::Closed => "closed",
            Self::Merged => "merged",
            Self::MergeFailed => "merge_failed",
            Self::BatchStarted => "batch_started",
            Self::MemberExcluded => "member_excluded",
            Self::ProofOpened => "proof_opened",
            Self::ProofPassed => "proof_passed",
            Self::ProofFailed => "proof_failed",
            Self::BatchCompleted => "batch_completed",
            Self::BatchFailed => "batch_failed",
            Self::BatchRecovered => "batch_recovered",
            Self::LaneHalted => "lane_halted",
        };
        f.write_str(s)
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When it happened
    pub at: DateTime<Utc>,
    /// What it concerns
    pub subject: AuditSubject,
    /// What happened
    pub action: AuditAction,
    /// Optional detail
    pub reason: Option<String>,
}

impl AuditEntry {
    /// Entry stamped now
    pub fn now(subject: AuditSubject, action: AuditAction, reason: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            subject,
            action,
            reason,
        }
    }
}

/// Result of a merge operation
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// Whether the merge was successful
    pub merged: bool,
    /// The SHA of the merge commit (if successful)
    pub sha: Option<String>,
    /// Message from the merge operation (especially on failure)
    pub message: Option<String>,
}

/// Outcome of merging one branch into another
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchMergeOutcome {
    /// Merge commit created (or nothing to merge)
    Merged {
        /// Resulting head of the destination branch, when known
        sha: Option<String>,
    },
    /// Source conflicts with destination
    Conflict,
}

/// Merge strategy/method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    /// Squash all commits into one
    Squash,
    /// Create a merge commit
    #[default]
    Merge,
    /// Rebase commits onto base branch
    Rebase,
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Squash => write!(f, "squash"),
            Self::Merge => write!(f, "merge"),
            Self::Rebase => write!(f, "rebase"),
        }
    }
}
