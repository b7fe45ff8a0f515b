//! GitLab platform service implementation

use crate::error::{Error, Result};
use crate::platform::{PlatformService, branch_merge_message};
use crate::types::{
    BranchMergeOutcome, MergeMethod, MergeResult, MrSnapshot, PipelineInfo, PipelineStatus,
    Platform, PlatformConfig, PrState, PullRequest,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// GitLab service using reqwest
pub struct GitLabService {
    client: Client,
    token: String,
    api_base: String,
    config: PlatformConfig,
    project_path: String,
    mergeability_interval: Duration,
}

#[derive(Deserialize)]
struct MergeRequest {
    iid: u64,
    web_url: String,
    source_branch: String,
    target_branch: String,
    title: String,
    #[serde(default)]
    draft: bool,
}

/// Full MR payload as returned by the single-MR endpoint
#[derive(Deserialize)]
struct MergeRequestDetails {
    iid: u64,
    title: String,
    state: String, // "opened", "closed", "merged", "locked"
    #[serde(default)]
    draft: bool,
    web_url: String,
    source_branch: String,
    target_branch: String,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    head_pipeline: Option<Pipeline>,
    #[serde(default)]
    assignees: Vec<User>,
    #[serde(default)]
    has_conflicts: bool,
    #[serde(default = "default_true")]
    blocking_discussions_resolved: bool,
    #[serde(default)]
    diverged_commits_count: Option<u64>,
    #[serde(default)]
    rebase_in_progress: Option<bool>,
    #[serde(default)]
    merge_error: Option<String>,
    #[serde(default)]
    merge_status: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
}

const fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct User {
    username: String,
}

/// MR approvals response
#[derive(Deserialize)]
struct MrApprovals {
    approved: bool,
}

/// Pipeline summary
#[derive(Deserialize)]
struct Pipeline {
    id: u64,
    status: String, // "success", "failed", "running", "pending", ...
    #[serde(default)]
    sha: Option<String>,
}

/// Merge response
#[derive(Deserialize)]
struct MergeResponse {
    state: String,
    merge_commit_sha: Option<String>,
}

impl From<MergeRequest> for PullRequest {
    fn from(mr: MergeRequest) -> Self {
        Self {
            number: mr.iid,
            html_url: mr.web_url,
            base_ref: mr.target_branch,
            head_ref: mr.source_branch,
            title: mr.title,
            node_id: None, // GitLab doesn't use GraphQL node IDs
            is_draft: mr.draft,
        }
    }
}

#[derive(Serialize)]
struct CreateMrPayload {
    source_branch: String,
    target_branch: String,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    remove_source_branch: bool,
}

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Polls of `merge_status` before a branch-merge MR is given up on
const MERGEABILITY_POLLS: u32 = 15;

/// `merge_status` values that are still being computed
const UNCHECKED_STATUSES: [&str; 3] = ["unchecked", "checking", "cannot_be_merged_recheck"];

/// Map an HTTP response to our error taxonomy
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{status}: {body}");
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(detail),
        StatusCode::NOT_FOUND => Error::NotFound(detail),
        s if s.is_server_error() => Error::Transient(detail),
        _ => Error::GitLabApi(detail),
    })
}

impl GitLabService {
    /// Create a new GitLab service
    pub fn new(token: String, owner: String, repo: String, host: Option<String>) -> Result<Self> {
        let host_name = host.clone().unwrap_or_else(|| "gitlab.com".to_string());
        Self::with_api_base(token, owner, repo, host, format!("https://{host_name}/api/v4"))
    }

    /// Create a service talking to an explicit API base URL
    /// (e.g. `http://127.0.0.1:1234/api/v4`)
    pub fn with_api_base(
        token: String,
        owner: String,
        repo: String,
        host: Option<String>,
        api_base: String,
    ) -> Result<Self> {
        let project_path = format!("{owner}/{repo}");

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::GitLabApi(format!("failed to create HTTP client: {e}")))?;

        let config_host = host.filter(|h| h != "gitlab.com");

        Ok(Self {
            client,
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
            config: PlatformConfig {
                platform: Platform::GitLab,
                owner,
                repo,
                host: config_host,
            },
            project_path,
            mergeability_interval: Duration::from_secs(2),
        })
    }

    /// Delay between `merge_status` polls of branch-merge MRs
    #[must_use]
    pub const fn mergeability_interval(mut self, interval: Duration) -> Self {
        self.mergeability_interval = interval;
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn encoded_project(&self) -> String {
        urlencoding::encode(&self.project_path).into_owned()
    }

    fn mr_url(&self, iid: u64, suffix: &str) -> String {
        self.api_url(&format!(
            "/projects/{}/merge_requests/{}{}",
            self.encoded_project(),
            iid,
            suffix
        ))
    }

    fn branch_url(&self, name: &str) -> String {
        self.api_url(&format!(
            "/projects/{}/repository/branches/{}",
            self.encoded_project(),
            urlencoding::encode(name)
        ))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        check(request.header("PRIVATE-TOKEN", &self.token).send().await?).await
    }

    async fn get_details(&self, iid: u64) -> Result<MergeRequestDetails> {
        let request = self.client.get(self.mr_url(iid, "")).query(&[
            ("include_rebase_in_progress", "true"),
            ("include_diverged_commits_count", "true"),
        ]);
        Ok(self.send(request).await?.json().await?)
    }

    async fn approvals_satisfied(&self, iid: u64) -> Result<bool> {
        let approvals: MrApprovals = self
            .send(self.client.get(self.mr_url(iid, "/approvals")))
            .await?
            .json()
            .await?;
        Ok(approvals.approved)
    }

    async fn update_labels(&self, iid: u64, field: &str, label: &str) -> Result<()> {
        let mut body = serde_json::Map::new();
        body.insert(field.to_string(), serde_json::Value::from(label));
        self.send(self.client.put(self.mr_url(iid, "")).json(&body))
            .await?;
        Ok(())
    }

    /// Wait for GitLab to finish computing mergeability of a fresh MR
    async fn await_mergeability(&self, iid: u64) -> Result<MergeRequestDetails> {
        let mut details = self.get_details(iid).await?;
        for _ in 0..MERGEABILITY_POLLS {
            let unchecked = details
                .merge_status
                .as_deref()
                .is_some_and(|s| UNCHECKED_STATUSES.contains(&s));
            if !unchecked {
                break;
            }
            tokio::time::sleep(self.mergeability_interval).await;
            details = self.get_details(iid).await?;
        }
        Ok(details)
    }
}

#[async_trait]
impl PlatformService for GitLabService {
    fn config(&self) -> &PlatformConfig {
        &self.config
    }

    async fn get_mr_snapshot(&self, number: u64) -> Result<MrSnapshot> {
        debug!(mr_iid = number, "getting MR snapshot");
        let mr = self.get_details(number).await?;
        let approvals_satisfied = self.approvals_satisfied(number).await?;

        let state = match mr.state.as_str() {
            "opened" | "locked" => PrState::Open,
            "merged" => PrState::Merged,
            _ => PrState::Closed,
        };

        let head_sha = mr.sha.unwrap_or_default();
        let pipeline = mr.head_pipeline.map(|p| PipelineInfo {
            id: p.id,
            status: PipelineStatus::from_gitlab(&p.status),
            sha: p.sha.unwrap_or_else(|| head_sha.clone()),
        });

        let snapshot = MrSnapshot {
            number: mr.iid,
            title: mr.title,
            web_url: mr.web_url,
            state,
            is_draft: mr.draft,
            source_branch: mr.source_branch,
            target_branch: mr.target_branch,
            head_sha,
            pipeline,
            approvals_satisfied,
            assignees: mr.assignees.into_iter().map(|u| u.username).collect(),
            has_conflicts: mr.has_conflicts,
            unresolved_discussions: !mr.blocking_discussions_resolved,
            behind_target: mr.diverged_commits_count.unwrap_or(0) > 0,
            rebase_in_progress: mr.rebase_in_progress.unwrap_or(false),
            rebase_error: mr.merge_error.filter(|e| !e.is_empty()),
            labels: mr.labels,
        };

        debug!(
            mr_iid = number,
            state = %snapshot.state,
            pipeline = ?snapshot.pipeline.as_ref().map(|p| p.status),
            behind = snapshot.behind_target,
            "got MR snapshot"
        );
        Ok(snapshot)
    }

    async fn rebase_mr(&self, number: u64) -> Result<()> {
        debug!(mr_iid = number, "requesting rebase");
        self.send(self.client.put(self.mr_url(number, "/rebase")))
            .await?;
        Ok(())
    }

    async fn merge_mr(
        &self,
        number: u64,
        method: MergeMethod,
        expected_sha: Option<&str>,
    ) -> Result<MergeResult> {
        debug!(mr_iid = number, %method, ?expected_sha, "merging MR");

        let mut body = match method {
            MergeMethod::Squash => serde_json::json!({ "squash": true }),
            MergeMethod::Merge | MergeMethod::Rebase => serde_json::json!({}),
        };
        if let Some(sha) = expected_sha {
            body["sha"] = serde_json::Value::String(sha.to_string());
        }

        let response = self
            .client
            .put(self.mr_url(number, "/merge"))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&body)
            .send()
            .await?;

        // 405: not mergeable, 406: already merged/closed or conflicts,
        // 409: sha mismatch, 422: branch protection
        let status = response.status();
        if matches!(status.as_u16(), 405 | 406 | 409 | 422) {
            let message = response.text().await.unwrap_or_default();
            debug!(mr_iid = number, %status, message, "merge refused");
            return Ok(MergeResult {
                merged: false,
                sha: None,
                message: Some(format!("{status}: {message}")),
            });
        }

        let response: MergeResponse = check(response).await?.json().await?;
        let merge_result = MergeResult {
            merged: response.state == "merged",
            sha: response.merge_commit_sha,
            message: None,
        };

        debug!(
            mr_iid = number,
            merged = merge_result.merged,
            sha = ?merge_result.sha,
            "merge complete"
        );
        Ok(merge_result)
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        match self.send(self.client.get(self.branch_url(name))).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        debug!(branch = name, base, "creating branch");
        let url = self.api_url(&format!(
            "/projects/{}/repository/branches",
            self.encoded_project()
        ));
        self.send(
            self.client
                .post(&url)
                .query(&[("branch", name), ("ref", base)]),
        )
        .await?;
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        debug!(branch = name, "deleting branch");
        match self.send(self.client.delete(self.branch_url(name))).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// GitLab has no direct branch-to-branch merge endpoint, so this goes
    /// through a short-lived MR that is merged with a custom commit message.
    async fn merge_branch_into_branch(
        &self,
        source: &str,
        dest: &str,
        skip_ci: bool,
    ) -> Result<BranchMergeOutcome> {
        debug!(source, dest, skip_ci, "merging branch into branch");

        let mr = match self.find_open_mr(source, dest).await? {
            Some(existing) => existing,
            None => {
                self.create_mr(
                    source,
                    dest,
                    &format!("Merge {source} into {dest}"),
                    "",
                    false,
                )
                .await?
            }
        };

        let details = self.await_mergeability(mr.number).await?;
        if details.has_conflicts || details.merge_status.as_deref() == Some("cannot_be_merged") {
            debug!(source, dest, mr_iid = mr.number, "branch merge conflicts");
            self.close_mr(mr.number).await?;
            return Ok(BranchMergeOutcome::Conflict);
        }

        let body = serde_json::json!({
            "merge_commit_message": branch_merge_message(source, dest, skip_ci),
            "should_remove_source_branch": false,
        });
        let response = self
            .client
            .put(self.mr_url(mr.number, "/merge"))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&body)
            .send()
            .await?;

        if matches!(response.status().as_u16(), 405 | 406 | 409) {
            debug!(source, dest, status = %response.status(), "branch merge refused");
            self.close_mr(mr.number).await?;
            return Ok(BranchMergeOutcome::Conflict);
        }

        let merged: MergeResponse = check(response).await?.json().await?;
        debug!(source, dest, sha = ?merged.merge_commit_sha, "branch merged");
        Ok(BranchMergeOutcome::Merged {
            sha: merged.merge_commit_sha,
        })
    }

    async fn find_open_mr(&self, source: &str, target: &str) -> Result<Option<PullRequest>> {
        debug!(source, target, "finding existing MR");
        let url = self.api_url(&format!(
            "/projects/{}/merge_requests",
            self.encoded_project()
        ));

        let mrs: Vec<MergeRequest> = self
            .send(self.client.get(&url).query(&[
                ("source_branch", source),
                ("target_branch", target),
                ("state", "opened"),
            ]))
            .await?
            .json()
            .await?;

        let result: Option<PullRequest> = mrs.into_iter().next().map(Into::into);
        if let Some(ref pr) = result {
            debug!(mr_iid = pr.number, "found existing MR");
        } else {
            debug!("no existing MR found");
        }
        Ok(result)
    }

    async fn create_mr(
        &self,
        source: &str,
        target: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PullRequest> {
        debug!(source, target, draft, "creating MR");
        let url = self.api_url(&format!(
            "/projects/{}/merge_requests",
            self.encoded_project()
        ));

        let payload = CreateMrPayload {
            source_branch: source.to_string(),
            target_branch: target.to_string(),
            // Draft status is carried by the title prefix
            title: if draft {
                format!("Draft: {title}")
            } else {
                title.to_string()
            },
            description: (!body.is_empty()).then(|| body.to_string()),
            remove_source_branch: false,
        };

        let mr: MergeRequest = self
            .send(self.client.post(&url).json(&payload))
            .await?
            .json()
            .await?;

        let pr: PullRequest = mr.into();
        debug!(mr_iid = pr.number, "created MR");
        Ok(pr)
    }

    async fn close_mr(&self, number: u64) -> Result<()> {
        debug!(mr_iid = number, "closing MR");
        self.send(
            self.client
                .put(self.mr_url(number, ""))
                .json(&serde_json::json!({ "state_event": "close" })),
        )
        .await?;
        Ok(())
    }

    async fn request_pipeline(&self, number: u64) -> Result<()> {
        debug!(mr_iid = number, "requesting MR pipeline");
        self.send(self.client.post(self.mr_url(number, "/pipelines")))
            .await?;
        Ok(())
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<()> {
        debug!(mr_iid = number, label, "adding label");
        self.update_labels(number, "add_labels", label).await
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        debug!(mr_iid = number, label, "removing label");
        self.update_labels(number, "remove_labels", label).await
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<()> {
        debug!(mr_iid = number, "creating MR comment");
        self.send(
            self.client
                .post(self.mr_url(number, "/notes"))
                .json(&serde_json::json!({ "body": body })),
        )
        .await?;
        debug!(mr_iid = number, "created MR comment");
        Ok(())
    }
}
