//! Platform services for GitHub and GitLab
//!
//! Provides a unified interface for the MR and branch operations the engine
//! needs, across platforms.

mod factory;
mod github;
mod gitlab;
mod retry;

pub use factory::create_platform_service;
pub use github::GitHubService;
pub use gitlab::GitLabService;
pub use retry::{RetryPolicy, RetryingPlatform, with_retry};

use crate::error::Result;
use crate::types::{BranchMergeOutcome, MergeMethod, MergeResult, MrSnapshot, PlatformConfig, PullRequest};
use async_trait::async_trait;

/// Commit message marker that suppresses CI on both platforms
pub const SKIP_CI: &str = "[skip ci]";

/// Platform service trait for MR and branch operations
///
/// One instance serves one project. This trait abstracts GitHub and GitLab,
/// allowing the same orchestration logic to work with either platform.
#[async_trait]
pub trait PlatformService: Send + Sync {
    /// Get the platform configuration
    fn config(&self) -> &PlatformConfig;

    /// Fetch everything known about an MR in one snapshot
    async fn get_mr_snapshot(&self, number: u64) -> Result<MrSnapshot>;

    /// Ask the platform to rebase the MR's source branch onto its target.
    ///
    /// Returns once the request is accepted; completion is observed through
    /// [`Self::get_mr_snapshot`].
    async fn rebase_mr(&self, number: u64) -> Result<()>;

    /// Merge the MR. `expected_sha` guards against merging an unvalidated head.
    async fn merge_mr(
        &self,
        number: u64,
        method: MergeMethod,
        expected_sha: Option<&str>,
    ) -> Result<MergeResult>;

    /// Whether a branch exists remotely
    async fn branch_exists(&self, name: &str) -> Result<bool>;

    /// Create a branch from the head of `base`
    async fn create_branch(&self, name: &str, base: &str) -> Result<()>;

    /// Delete a branch. Deleting a missing branch is not an error.
    async fn delete_branch(&self, name: &str) -> Result<()>;

    /// Merge `source` into `dest`, optionally suppressing CI for the
    /// resulting commit
    async fn merge_branch_into_branch(
        &self,
        source: &str,
        dest: &str,
        skip_ci: bool,
    ) -> Result<BranchMergeOutcome>;

    /// Find an open MR from `source` into `target`
    async fn find_open_mr(&self, source: &str, target: &str) -> Result<Option<PullRequest>>;

    /// Open an MR
    async fn create_mr(
        &self,
        source: &str,
        target: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PullRequest>;

    /// Close an MR without merging
    async fn close_mr(&self, number: u64) -> Result<()>;

    /// Start a pipeline for the MR's current head
    async fn request_pipeline(&self, number: u64) -> Result<()>;

    /// Add a label
    async fn add_label(&self, number: u64, label: &str) -> Result<()>;

    /// Remove a label. Removing an absent label is not an error.
    async fn remove_label(&self, number: u64, label: &str) -> Result<()>;

    /// Post a comment
    async fn add_comment(&self, number: u64, body: &str) -> Result<()>;
}

/// Commit message for merging a branch into a batch branch
pub fn branch_merge_message(source: &str, dest: &str, skip_ci: bool) -> String {
    if skip_ci {
        format!("Merge branch '{source}' into '{dest}' {SKIP_CI}")
    } else {
        format!("Merge branch '{source}' into '{dest}'")
    }
}
