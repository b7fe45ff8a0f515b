//! Mock platform service for testing
//!
//! A small in-memory remote: branches, MRs with pipelines, labels and
//! comments. Behaviour is scripted per test (pipeline results after a
//! rebase, proof pipeline result, conflicting branches, transient failures)
//! and every mutating call is recorded.

#![allow(dead_code)]

use async_trait::async_trait;
use merge_assist::error::{Error, Result};
use merge_assist::platform::PlatformService;
use merge_assist::types::{
    BranchMergeOutcome, MergeMethod, MergeResult, MrSnapshot, PipelineInfo, PipelineStatus,
    Platform, PlatformConfig, PrState, PullRequest,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

/// Automation account used by the fixtures
pub const BOT: &str = "merge-bot";

/// Prefix of batch branches in the default lane settings
pub const BATCH_PREFIX: &str = "merge-assist/batch";

/// Recorded mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Rebase(u64),
    Merge { number: u64, sha: Option<String> },
    CreateBranch { name: String, base: String },
    DeleteBranch(String),
    MergeBranch { source: String, dest: String, skip_ci: bool },
    CreateMr { source: String, target: String, title: String, draft: bool },
    CloseMr(u64),
    RequestPipeline(u64),
    AddLabel { number: u64, label: String },
    RemoveLabel { number: u64, label: String },
    Comment { number: u64, body: String },
}

#[derive(Default)]
struct Remote {
    /// Branch name → source branches merged into it since creation
    branches: BTreeMap<String, Vec<String>>,
    mrs: BTreeMap<u64, MrSnapshot>,
    next_number: u64,
    next_sha: u64,
    next_pipeline: u64,
    /// Pipeline result after a rebase, per MR (default success)
    rebase_results: HashMap<u64, PipelineStatus>,
    /// Proof pipeline result; `None` never finishes
    proof_result: Option<PipelineStatus>,
    /// Source branches that conflict with any batch branch
    conflicts: HashSet<String>,
    /// MRs whose merge call is refused
    refuse_merge: HashSet<u64>,
    /// Operation → transient failures still to inject
    transient: HashMap<String, u32>,
    /// Highest number of proof MRs open at once
    max_open_proofs: usize,
    calls: Vec<Call>,
}

impl Remote {
    fn sha(&mut self) -> String {
        self.next_sha += 1;
        format!("sha{:04}", self.next_sha)
    }

    fn pipeline(&mut self, status: PipelineStatus, sha: &str) -> PipelineInfo {
        self.next_pipeline += 1;
        PipelineInfo {
            id: self.next_pipeline,
            status,
            sha: sha.to_string(),
        }
    }

    fn open_proofs(&self) -> usize {
        self.mrs
            .values()
            .filter(|m| m.state == PrState::Open && m.source_branch.starts_with(BATCH_PREFIX))
            .count()
    }

    fn mr_mut(&mut self, number: u64) -> Result<&mut MrSnapshot> {
        self.mrs
            .get_mut(&number)
            .ok_or_else(|| Error::NotFound(format!("MR !{number}")))
    }
}

/// Stateful in-memory remote
pub struct MockPlatformService {
    config: PlatformConfig,
    remote: Mutex<Remote>,
}

impl MockPlatformService {
    /// Remote for `group/app` with a `main` branch
    pub fn new() -> Self {
        let mut remote = Remote {
            next_number: 100,
            proof_result: Some(PipelineStatus::Success),
            ..Remote::default()
        };
        remote.branches.insert("main".to_string(), Vec::new());
        Self {
            config: PlatformConfig {
                platform: Platform::GitLab,
                owner: "group".to_string(),
                repo: "app".to_string(),
                host: None,
            },
            remote: Mutex::new(remote),
        }
    }

    fn remote(&self) -> std::sync::MutexGuard<'_, Remote> {
        self.remote.lock().unwrap()
    }

    fn transient(&self, op: &str) -> Result<()> {
        let mut remote = self.remote();
        if let Some(left) = remote.transient.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::Transient(format!("{op}: 503 Service Unavailable")));
            }
        }
        Ok(())
    }

    // === Setup ===

    /// Add or replace an MR
    pub fn add_mr(&self, snapshot: MrSnapshot) {
        let mut remote = self.remote();
        remote
            .branches
            .entry(snapshot.source_branch.clone())
            .or_default();
        remote.mrs.insert(snapshot.number, snapshot);
    }

    /// Change an MR in place
    pub fn update_mr(&self, number: u64, f: impl FnOnce(&mut MrSnapshot)) {
        let mut remote = self.remote();
        f(remote.mrs.get_mut(&number).unwrap());
    }

    /// Add a branch
    pub fn add_branch(&self, name: &str) {
        self.remote().branches.insert(name.to_string(), Vec::new());
    }

    /// Remove a branch
    pub fn remove_branch(&self, name: &str) {
        self.remote().branches.remove(name);
    }

    /// Pipeline result an MR gets after its next rebase
    pub fn set_rebase_result(&self, number: u64, status: PipelineStatus) {
        self.remote().rebase_results.insert(number, status);
    }

    /// Proof pipeline result, `None` to keep it running forever
    pub fn set_proof_result(&self, status: Option<PipelineStatus>) {
        self.remote().proof_result = status;
    }

    /// Merging this source branch into a batch branch conflicts
    pub fn add_conflict(&self, source_branch: &str) {
        self.remote().conflicts.insert(source_branch.to_string());
    }

    /// Refuse the merge call for an MR
    pub fn refuse_merge(&self, number: u64) {
        self.remote().refuse_merge.insert(number);
    }

    /// Fail the next `times` calls of `op` with a transient error
    pub fn fail_transiently(&self, op: &str, times: u32) {
        self.remote().transient.insert(op.to_string(), times);
    }

    // === Inspection ===

    /// Current view of an MR
    pub fn mr(&self, number: u64) -> MrSnapshot {
        self.remote().mrs.get(&number).cloned().unwrap()
    }

    /// Whether a branch exists
    pub fn has_branch(&self, name: &str) -> bool {
        self.remote().branches.contains_key(name)
    }

    /// Source branches merged into a branch since it was created
    pub fn branch_contents(&self, name: &str) -> Option<Vec<String>> {
        self.remote().branches.get(name).cloned()
    }

    /// Every recorded call
    pub fn calls(&self) -> Vec<Call> {
        self.remote().calls.clone()
    }

    /// Comments posted on an MR
    pub fn comments(&self, number: u64) -> Vec<String> {
        self.remote()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Comment { number: n, body } if *n == number => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    /// MRs merged into their target, in merge order
    pub fn merged(&self) -> Vec<u64> {
        self.remote()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Merge { number, .. } => Some(*number),
                _ => None,
            })
            .collect()
    }

    /// Proof MRs created so far
    pub fn proof_mrs(&self) -> Vec<MrSnapshot> {
        self.remote()
            .mrs
            .values()
            .filter(|m| m.source_branch.starts_with(BATCH_PREFIX))
            .cloned()
            .collect()
    }

    /// Highest number of proof MRs that were open at the same time
    pub fn max_open_proofs(&self) -> usize {
        self.remote().max_open_proofs
    }
}

impl Default for MockPlatformService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformService for MockPlatformService {
    fn config(&self) -> &PlatformConfig {
        &self.config
    }

    async fn get_mr_snapshot(&self, number: u64) -> Result<MrSnapshot> {
        self.transient("get_mr_snapshot")?;
        let remote = self.remote();
        remote
            .mrs
            .get(&number)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("MR !{number}")))
    }

    async fn rebase_mr(&self, number: u64) -> Result<()> {
        self.transient("rebase_mr")?;
        let mut remote = self.remote();
        remote.calls.push(Call::Rebase(number));
        let sha = remote.sha();
        let status = remote
            .rebase_results
            .get(&number)
            .copied()
            .unwrap_or(PipelineStatus::Success);
        let pipeline = remote.pipeline(status, &sha);
        let mr = remote.mr_mut(number)?;
        mr.head_sha = sha;
        mr.behind_target = false;
        mr.pipeline = Some(pipeline);
        Ok(())
    }

    async fn merge_mr(
        &self,
        number: u64,
        _method: MergeMethod,
        expected_sha: Option<&str>,
    ) -> Result<MergeResult> {
        self.transient("merge_mr")?;
        let mut remote = self.remote();
        if remote.refuse_merge.contains(&number) {
            return Ok(MergeResult {
                merged: false,
                sha: None,
                message: Some("405: Method Not Allowed".to_string()),
            });
        }

        let merge_sha = remote.sha();
        let mr = remote.mr_mut(number)?;
        if mr.state != PrState::Open {
            return Ok(MergeResult {
                merged: false,
                sha: None,
                message: Some(format!("MR is {}", mr.state)),
            });
        }
        if expected_sha.is_some_and(|sha| sha != mr.head_sha) {
            return Ok(MergeResult {
                merged: false,
                sha: None,
                message: Some("409: SHA does not match HEAD of source branch".to_string()),
            });
        }
        mr.state = PrState::Merged;
        let target = mr.target_branch.clone();

        // The target moved: every other open MR into it is now behind
        for other in remote.mrs.values_mut() {
            if other.state == PrState::Open && other.target_branch == target {
                other.behind_target = true;
            }
        }
        remote.calls.push(Call::Merge {
            number,
            sha: expected_sha.map(ToString::to_string),
        });
        Ok(MergeResult {
            merged: true,
            sha: Some(merge_sha),
            message: None,
        })
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        self.transient("branch_exists")?;
        Ok(self.remote().branches.contains_key(name))
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        self.transient("create_branch")?;
        let mut remote = self.remote();
        if remote.branches.contains_key(name) {
            return Err(Error::Platform(format!("branch {name} already exists")));
        }
        if !remote.branches.contains_key(base) {
            return Err(Error::NotFound(format!("branch {base}")));
        }
        remote.branches.insert(name.to_string(), Vec::new());
        remote.calls.push(Call::CreateBranch {
            name: name.to_string(),
            base: base.to_string(),
        });
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        self.transient("delete_branch")?;
        let mut remote = self.remote();
        remote.branches.remove(name);
        remote.calls.push(Call::DeleteBranch(name.to_string()));
        Ok(())
    }

    async fn merge_branch_into_branch(
        &self,
        source: &str,
        dest: &str,
        skip_ci: bool,
    ) -> Result<BranchMergeOutcome> {
        self.transient("merge_branch_into_branch")?;
        let mut remote = self.remote();
        remote.calls.push(Call::MergeBranch {
            source: source.to_string(),
            dest: dest.to_string(),
            skip_ci,
        });
        if remote.conflicts.contains(source) {
            return Ok(BranchMergeOutcome::Conflict);
        }
        let sha = remote.sha();
        let contents = remote
            .branches
            .get_mut(dest)
            .ok_or_else(|| Error::NotFound(format!("branch {dest}")))?;
        contents.push(source.to_string());
        Ok(BranchMergeOutcome::Merged { sha: Some(sha) })
    }

    async fn find_open_mr(&self, source: &str, target: &str) -> Result<Option<PullRequest>> {
        self.transient("find_open_mr")?;
        let remote = self.remote();
        Ok(remote
            .mrs
            .values()
            .find(|m| {
                m.state == PrState::Open && m.source_branch == source && m.target_branch == target
            })
            .map(|m| PullRequest {
                number: m.number,
                html_url: m.web_url.clone(),
                base_ref: m.target_branch.clone(),
                head_ref: m.source_branch.clone(),
                title: m.title.clone(),
                node_id: None,
                is_draft: m.is_draft,
            }))
    }

    async fn create_mr(
        &self,
        source: &str,
        target: &str,
        title: &str,
        _body: &str,
        draft: bool,
    ) -> Result<PullRequest> {
        self.transient("create_mr")?;
        let mut remote = self.remote();
        remote.next_number += 1;
        let number = remote.next_number;
        let head_sha = remote.sha();
        let web_url = format!("https://gitlab.example.com/group/app/-/merge_requests/{number}");
        remote.mrs.insert(
            number,
            MrSnapshot {
                number,
                title: title.to_string(),
                web_url: web_url.clone(),
                state: PrState::Open,
                is_draft: draft,
                source_branch: source.to_string(),
                target_branch: target.to_string(),
                head_sha,
                pipeline: None,
                approvals_satisfied: false,
                assignees: vec![],
                has_conflicts: false,
                unresolved_discussions: false,
                behind_target: false,
                rebase_in_progress: false,
                rebase_error: None,
                labels: vec![],
            },
        );
        remote.calls.push(Call::CreateMr {
            source: source.to_string(),
            target: target.to_string(),
            title: title.to_string(),
            draft,
        });
        let open = remote.open_proofs();
        remote.max_open_proofs = remote.max_open_proofs.max(open);
        Ok(PullRequest {
            number,
            html_url: web_url,
            base_ref: target.to_string(),
            head_ref: source.to_string(),
            title: title.to_string(),
            node_id: None,
            is_draft: draft,
        })
    }

    async fn close_mr(&self, number: u64) -> Result<()> {
        self.transient("close_mr")?;
        let mut remote = self.remote();
        remote.mr_mut(number)?.state = PrState::Closed;
        remote.calls.push(Call::CloseMr(number));
        Ok(())
    }

    async fn request_pipeline(&self, number: u64) -> Result<()> {
        self.transient("request_pipeline")?;
        let mut remote = self.remote();
        let status = remote.proof_result.unwrap_or(PipelineStatus::Running);
        let head = remote.mr_mut(number)?.head_sha.clone();
        let pipeline = remote.pipeline(status, &head);
        remote.mr_mut(number)?.pipeline = Some(pipeline);
        remote.calls.push(Call::RequestPipeline(number));
        Ok(())
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<()> {
        self.transient("add_label")?;
        let mut remote = self.remote();
        let mr = remote.mr_mut(number)?;
        if !mr.labels.iter().any(|l| l == label) {
            mr.labels.push(label.to_string());
        }
        remote.calls.push(Call::AddLabel {
            number,
            label: label.to_string(),
        });
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        self.transient("remove_label")?;
        let mut remote = self.remote();
        remote.mr_mut(number)?.labels.retain(|l| l != label);
        remote.calls.push(Call::RemoveLabel {
            number,
            label: label.to_string(),
        });
        Ok(())
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<()> {
        self.transient("add_comment")?;
        let mut remote = self.remote();
        remote.mr_mut(number)?;
        remote.calls.push(Call::Comment {
            number,
            body: body.to_string(),
        });
        Ok(())
    }
}
