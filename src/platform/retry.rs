//! Exponential backoff for transient API failures
//!
//! Only errors where [`Error::is_transient`] holds are retried. Everything
//! else, and every pipeline result, goes straight back to the caller.

use super::PlatformService;
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::types::{BranchMergeOutcome, MergeMethod, MergeResult, MrSnapshot, PlatformConfig, PullRequest};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// First delay
    pub base_delay: Duration,
    /// Delay cap
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// No retries at all
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

/// Run `op`, retrying transient failures with exponential backoff
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = what,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "transient API failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decorator adding retries to every call of an inner platform service
pub struct RetryingPlatform {
    inner: Arc<dyn PlatformService>,
    policy: RetryPolicy,
}

impl RetryingPlatform {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn PlatformService>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl PlatformService for RetryingPlatform {
    fn config(&self) -> &PlatformConfig {
        self.inner.config()
    }

    async fn get_mr_snapshot(&self, number: u64) -> Result<MrSnapshot> {
        with_retry(&self.policy, "get_mr_snapshot", || {
            self.inner.get_mr_snapshot(number)
        })
        .await
    }

    async fn rebase_mr(&self, number: u64) -> Result<()> {
        with_retry(&self.policy, "rebase_mr", || self.inner.rebase_mr(number)).await
    }

    async fn merge_mr(
        &self,
        number: u64,
        method: MergeMethod,
        expected_sha: Option<&str>,
    ) -> Result<MergeResult> {
        with_retry(&self.policy, "merge_mr", || {
            self.inner.merge_mr(number, method, expected_sha)
        })
        .await
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        with_retry(&self.policy, "branch_exists", || self.inner.branch_exists(name)).await
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        with_retry(&self.policy, "create_branch", || {
            self.inner.create_branch(name, base)
        })
        .await
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        with_retry(&self.policy, "delete_branch", || self.inner.delete_branch(name)).await
    }

    async fn merge_branch_into_branch(
        &self,
        source: &str,
        dest: &str,
        skip_ci: bool,
    ) -> Result<BranchMergeOutcome> {
        with_retry(&self.policy, "merge_branch_into_branch", || {
            self.inner.merge_branch_into_branch(source, dest, skip_ci)
        })
        .await
    }

    async fn find_open_mr(&self, source: &str, target: &str) -> Result<Option<PullRequest>> {
        with_retry(&self.policy, "find_open_mr", || {
            self.inner.find_open_mr(source, target)
        })
        .await
    }

    async fn create_mr(
        &self,
        source: &str,
        target: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PullRequest> {
        with_retry(&self.policy, "create_mr", || {
            self.inner.create_mr(source, target, title, body, draft)
        })
        .await
    }

    async fn close_mr(&self, number: u64) -> Result<()> {
        with_retry(&self.policy, "close_mr", || self.inner.close_mr(number)).await
    }

    async fn request_pipeline(&self, number: u64) -> Result<()> {
        with_retry(&self.policy, "request_pipeline", || {
            self.inner.request_pipeline(number)
        })
        .await
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<()> {
        with_retry(&self.policy, "add_label", || self.inner.add_label(number, label)).await
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        with_retry(&self.policy, "remove_label", || {
            self.inner.remove_label(number, label)
        })
        .await
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<()> {
        with_retry(&self.policy, "add_comment", || self.inner.add_comment(number, body)).await
    }
}
