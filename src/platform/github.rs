//! GitHub platform service implementation

use crate::error::{Error, Result};
use crate::platform::{PlatformService, branch_merge_message};
use crate::types::{
    BranchMergeOutcome, MergeMethod, MergeResult, MrSnapshot, PipelineInfo, PipelineStatus,
    Platform, PlatformConfig, PrState, PullRequest,
};
use async_trait::async_trait;
use octocrab::Octocrab;
use octocrab::models::pulls::ReviewState;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

impl<T> GraphQlResponse<T> {
    fn into_data(self) -> Result<T> {
        if let Some(errors) = self.errors
            && !errors.is_empty()
        {
            let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
            return Err(Error::GitHubApi(format!(
                "GraphQL error: {}",
                messages.join(", ")
            )));
        }
        self.data
            .ok_or_else(|| Error::GitHubApi("No data in GraphQL response".to_string()))
    }
}

#[derive(Deserialize)]
struct ReviewThreadsData {
    repository: Option<ReviewThreadsRepository>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewThreadsRepository {
    pull_request: Option<ReviewThreadsPullRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewThreadsPullRequest {
    review_threads: ReviewThreadConnection,
}

#[derive(Deserialize)]
struct ReviewThreadConnection {
    nodes: Vec<ReviewThread>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewThread {
    is_resolved: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBranchData {
    #[allow(dead_code)]
    update_pull_request_branch: serde_json::Value,
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Deserialize)]
struct GitCommit {
    sha: String,
    tree: GitObject,
}

#[derive(Deserialize)]
struct Comparison {
    behind_by: u64,
}

#[derive(Deserialize)]
struct MergeCommit {
    sha: String,
}

/// GitHub service using octocrab, with raw requests for the git data and
/// checks endpoints
pub struct GitHubService {
    client: Octocrab,
    config: PlatformConfig,
    /// Token for raw HTTP requests
    token: String,
    /// HTTP client for raw requests
    http_client: Client,
    /// API base URL for raw requests
    api_base: String,
}

/// Map a raw HTTP response to our error taxonomy
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let exhausted = response
        .headers()
        .get("x-ratelimit-remaining")
        .is_some_and(|v| v.as_bytes() == b"0");
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{status}: {body}");
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(detail),
        StatusCode::FORBIDDEN if exhausted => Error::RateLimited(detail),
        StatusCode::NOT_FOUND => Error::NotFound(detail),
        s if s.is_server_error() => Error::Transient(detail),
        _ => Error::GitHubApi(detail),
    })
}

/// HTTP status carried by an octocrab error, if any
fn octocrab_status(e: &octocrab::Error) -> Option<u16> {
    match e {
        octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
        _ => None,
    }
}

/// Map octocrab errors so retry and not-found handling see the same
/// taxonomy as raw requests
fn map_octocrab(e: octocrab::Error) -> Error {
    match octocrab_status(&e) {
        Some(429) => Error::RateLimited(e.to_string()),
        Some(404) => Error::NotFound(e.to_string()),
        Some(s) if s >= 500 => Error::Transient(e.to_string()),
        _ => Error::Octocrab(e),
    }
}

/// Aggregate check runs and commit statuses into one pipeline status
fn aggregate_checks(runs: &[CheckRun], combined: Option<&CombinedStatus>) -> Option<PipelineStatus> {
    let mut statuses = Vec::new();

    for run in runs {
        let status = if run.status == "completed" {
            match run.conclusion.as_deref() {
                Some("success" | "neutral" | "skipped") => PipelineStatus::Success,
                Some("cancelled") => PipelineStatus::Canceled,
                Some("action_required") => PipelineStatus::Manual,
                // failure, timed_out, stale, startup_failure, or none at all
                _ => PipelineStatus::Failed,
            }
        } else if run.status == "queued" {
            PipelineStatus::Pending
        } else {
            PipelineStatus::Running
        };
        statuses.push(status);
    }

    if let Some(combined) = combined
        && combined.total_count > 0
    {
        statuses.push(match combined.state.as_str() {
            "success" => PipelineStatus::Success,
            "pending" => PipelineStatus::Pending,
            _ => PipelineStatus::Failed,
        });
    }

    if statuses.is_empty() {
        return None;
    }

    // Failures dominate, then anything unfinished, then success
    let rank = |s: &PipelineStatus| match s {
        PipelineStatus::Failed => 0,
        PipelineStatus::Canceled => 1,
        PipelineStatus::Manual => 2,
        PipelineStatus::Running => 3,
        PipelineStatus::Pending | PipelineStatus::Created => 4,
        PipelineStatus::Skipped => 5,
        PipelineStatus::Success => 6,
    };
    statuses.into_iter().min_by_key(rank)
}

#[derive(Deserialize)]
struct CheckRunsResponse {
    check_runs: Vec<CheckRun>,
}

#[derive(Deserialize)]
struct CheckRun {
    status: String,
    conclusion: Option<String>,
}

#[derive(Deserialize)]
struct CombinedStatus {
    state: String,
    total_count: u32,
}

impl GitHubService {
    /// Create a new GitHub service
    pub fn new(token: &str, owner: String, repo: String, host: Option<String>) -> Result<Self> {
        let api_base = host.as_ref().map_or_else(
            || "https://api.github.com".to_string(),
            |h| format!("https://{h}/api/v3"),
        );
        Self::with_api_base(token, owner, repo, host, api_base)
    }

    /// Create a service talking to an explicit API base URL
    pub fn with_api_base(
        token: &str,
        owner: String,
        repo: String,
        host: Option<String>,
        api_base: String,
    ) -> Result<Self> {
        let api_base = api_base.trim_end_matches('/').to_string();
        let builder = Octocrab::builder()
            .personal_token(token.to_string())
            .base_uri(&api_base)
            .map_err(|e| Error::GitHubApi(e.to_string()))?;

        let client = builder
            .build()
            .map_err(|e| Error::GitHubApi(e.to_string()))?;

        let http_client = Client::builder()
            .user_agent("merge-assist")
            .build()
            .map_err(|e| Error::GitHubApi(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            config: PlatformConfig {
                platform: Platform::GitHub,
                owner,
                repo,
                host,
            },
            token: token.to_string(),
            http_client,
            api_base,
        })
    }

    fn raw(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/repos/{}/{}{}",
            self.api_base, self.config.owner, self.config.repo, path
        );
        self.http_client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        check(request.send().await?).await
    }

    async fn get_pr(&self, number: u64) -> Result<octocrab::models::pulls::PullRequest> {
        self.client
            .pulls(&self.config.owner, &self.config.repo)
            .get(number)
            .await
            .map_err(map_octocrab)
    }

    async fn ref_sha(&self, branch: &str) -> Result<String> {
        let git_ref: GitRef = self
            .send(self.raw(Method::GET, &format!("/git/ref/heads/{branch}")))
            .await?
            .json()
            .await?;
        Ok(git_ref.object.sha)
    }

    /// Approved by at least one reviewer, with no outstanding change requests
    async fn approvals_satisfied(&self, number: u64) -> Result<bool> {
        let reviews = self
            .client
            .pulls(&self.config.owner, &self.config.repo)
            .list_reviews(number)
            .send()
            .await
            .map_err(map_octocrab)?;

        // Latest decisive review per reviewer
        let mut latest: HashMap<String, ReviewState> = HashMap::new();
        for review in reviews.items {
            let (Some(user), Some(state)) = (review.user, review.state) else {
                continue;
            };
            if matches!(state, ReviewState::Approved | ReviewState::ChangesRequested) {
                latest.insert(user.login, state);
            }
        }

        let approved = latest.values().any(|s| *s == ReviewState::Approved);
        let blocked = latest.values().any(|s| *s == ReviewState::ChangesRequested);
        Ok(approved && !blocked)
    }

    async fn unresolved_threads(&self, number: u64) -> Result<bool> {
        let response: GraphQlResponse<ReviewThreadsData> = self
            .client
            .graphql(&serde_json::json!({
                "query": r"
                    query ReviewThreads($owner: String!, $repo: String!, $number: Int!) {
                        repository(owner: $owner, name: $repo) {
                            pullRequest(number: $number) {
                                reviewThreads(first: 100) {
                                    nodes { isResolved }
                                }
                            }
                        }
                    }
                ",
                "variables": {
                    "owner": self.config.owner,
                    "repo": self.config.repo,
                    "number": number,
                }
            }))
            .await
            .map_err(map_octocrab)?;

        let threads = response
            .into_data()?
            .repository
            .and_then(|r| r.pull_request)
            .map(|p| p.review_threads.nodes)
            .unwrap_or_default();
        Ok(threads.iter().any(|t| !t.is_resolved))
    }

    async fn behind_by(&self, base: &str, head_sha: &str) -> Result<u64> {
        let comparison: Comparison = self
            .send(self.raw(Method::GET, &format!("/compare/{base}...{head_sha}")))
            .await?
            .json()
            .await?;
        Ok(comparison.behind_by)
    }

    /// CI status of a commit from both check runs and legacy commit statuses
    async fn pipeline_for(&self, sha: &str) -> Result<Option<PipelineInfo>> {
        let runs: CheckRunsResponse = self
            .send(self.raw(Method::GET, &format!("/commits/{sha}/check-runs")))
            .await?
            .json()
            .await?;

        let combined: Option<CombinedStatus> = match self
            .send(self.raw(Method::GET, &format!("/commits/{sha}/status")))
            .await
        {
            Ok(response) => Some(response.json().await?),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let status = aggregate_checks(&runs.check_runs, combined.as_ref());
        debug!(sha, ?status, runs = runs.check_runs.len(), "aggregated checks");
        Ok(status.map(|status| PipelineInfo {
            id: 0,
            status,
            sha: sha.to_string(),
        }))
    }
}

/// Helper to convert octocrab PR to our `PullRequest` type
fn pr_from_octocrab(pr: &octocrab::models::pulls::PullRequest) -> PullRequest {
    PullRequest {
        number: pr.number,
        html_url: pr
            .html_url
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
        base_ref: pr.base.ref_field.clone(),
        head_ref: pr.head.ref_field.clone(),
        title: pr.title.as_deref().unwrap_or_default().to_string(),
        node_id: pr.node_id.clone(),
        is_draft: pr.draft.unwrap_or(false),
    }
}

#[async_trait]
impl PlatformService for GitHubService {
    fn config(&self) -> &PlatformConfig {
        &self.config
    }

    async fn get_mr_snapshot(&self, number: u64) -> Result<MrSnapshot> {
        debug!(pr_number = number, "getting PR snapshot");
        let pr = self.get_pr(number).await?;

        let state = match pr.state {
            Some(octocrab::models::IssueState::Open) => PrState::Open,
            Some(_) if pr.merged_at.is_some() => PrState::Merged,
            // IssueState is non-exhaustive
            Some(_) | None => PrState::Closed,
        };

        let head_sha = pr.head.sha.clone();
        let base_ref = pr.base.ref_field.clone();

        let (pipeline, approvals_satisfied, unresolved_discussions) = if state == PrState::Open {
            (
                self.pipeline_for(&head_sha).await?,
                self.approvals_satisfied(number).await?,
                self.unresolved_threads(number).await?,
            )
        } else {
            (None, false, false)
        };
        let behind_target = state == PrState::Open && self.behind_by(&base_ref, &head_sha).await? > 0;

        let snapshot = MrSnapshot {
            number: pr.number,
            title: pr.title.clone().unwrap_or_default(),
            web_url: pr
                .html_url
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            state,
            is_draft: pr.draft.unwrap_or(false),
            source_branch: pr.head.ref_field.clone(),
            target_branch: base_ref,
            head_sha,
            pipeline,
            approvals_satisfied,
            assignees: pr
                .assignees
                .iter()
                .flatten()
                .map(|a| a.login.clone())
                .collect(),
            has_conflicts: pr.mergeable == Some(false),
            unresolved_discussions,
            behind_target,
            // Branch updates are synchronous from our side; progress is
            // observed as the head sha changing
            rebase_in_progress: false,
            rebase_error: None,
            labels: pr
                .labels
                .iter()
                .flatten()
                .map(|l| l.name.clone())
                .collect(),
        };

        debug!(
            pr_number = number,
            state = %snapshot.state,
            pipeline = ?snapshot.pipeline.as_ref().map(|p| p.status),
            behind = snapshot.behind_target,
            "got PR snapshot"
        );
        Ok(snapshot)
    }

    async fn rebase_mr(&self, number: u64) -> Result<()> {
        debug!(pr_number = number, "requesting branch update");
        let pr = self.get_pr(number).await?;
        let node_id = pr.node_id.as_ref().ok_or_else(|| {
            Error::GitHubApi("PR missing node_id for GraphQL mutation".to_string())
        })?;

        let response: GraphQlResponse<UpdateBranchData> = self
            .client
            .graphql(&serde_json::json!({
                "query": r"
                    mutation UpdateBranch($pullRequestId: ID!) {
                        updatePullRequestBranch(input: { pullRequestId: $pullRequestId, updateMethod: REBASE }) {
                            pullRequest { id }
                        }
                    }
                ",
                "variables": {
                    "pullRequestId": node_id
                }
            }))
            .await
            .map_err(map_octocrab)?;

        response.into_data()?;
        debug!(pr_number = number, "branch update requested");
        Ok(())
    }

    async fn merge_mr(
        &self,
        number: u64,
        method: MergeMethod,
        expected_sha: Option<&str>,
    ) -> Result<MergeResult> {
        debug!(pr_number = number, %method, ?expected_sha, "merging PR");

        let octocrab_method = match method {
            MergeMethod::Squash => octocrab::params::pulls::MergeMethod::Squash,
            MergeMethod::Merge => octocrab::params::pulls::MergeMethod::Merge,
            MergeMethod::Rebase => octocrab::params::pulls::MergeMethod::Rebase,
        };

        let pulls = self.client.pulls(&self.config.owner, &self.config.repo);
        let mut builder = pulls.merge(number).method(octocrab_method);
        if let Some(sha) = expected_sha {
            builder = builder.sha(sha);
        }

        let result = match builder.send().await {
            Ok(result) => result,
            // 405: not mergeable, 409: head moved, 422: validation
            Err(e) if matches!(octocrab_status(&e), Some(405 | 409 | 422)) => {
                debug!(pr_number = number, error = %e, "merge refused");
                return Ok(MergeResult {
                    merged: false,
                    sha: None,
                    message: Some(e.to_string()),
                });
            }
            Err(e) => return Err(map_octocrab(e)),
        };

        let merge_result = MergeResult {
            merged: result.merged,
            sha: result.sha,
            message: result.message,
        };

        debug!(
            pr_number = number,
            merged = merge_result.merged,
            sha = ?merge_result.sha,
            "merge complete"
        );
        Ok(merge_result)
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        match self.ref_sha(name).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        debug!(branch = name, base, "creating branch");
        let sha = self.ref_sha(base).await?;
        self.send(self.raw(Method::POST, "/git/refs").json(&serde_json::json!({
            "ref": format!("refs/heads/{name}"),
            "sha": sha,
        })))
        .await?;
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        debug!(branch = name, "deleting branch");
        match self
            .send(self.raw(Method::DELETE, &format!("/git/refs/heads/{name}")))
            .await
        {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            // 422 "Reference does not exist"
            Err(Error::GitHubApi(msg)) if msg.starts_with("422") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn merge_branch_into_branch(
        &self,
        source: &str,
        dest: &str,
        skip_ci: bool,
    ) -> Result<BranchMergeOutcome> {
        debug!(source, dest, skip_ci, "merging branch into branch");
        let response = self
            .raw(Method::POST, "/merges")
            .json(&serde_json::json!({
                "base": dest,
                "head": source,
                "commit_message": branch_merge_message(source, dest, skip_ci),
            }))
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => {
                debug!(source, dest, "branch merge conflicts");
                Ok(BranchMergeOutcome::Conflict)
            }
            StatusCode::NO_CONTENT => {
                debug!(source, dest, "nothing to merge");
                Ok(BranchMergeOutcome::Merged { sha: None })
            }
            _ => {
                let commit: MergeCommit = check(response).await?.json().await?;
                debug!(source, dest, sha = %commit.sha, "branch merged");
                Ok(BranchMergeOutcome::Merged {
                    sha: Some(commit.sha),
                })
            }
        }
    }

    async fn find_open_mr(&self, source: &str, target: &str) -> Result<Option<PullRequest>> {
        debug!(source, target, "finding existing PR");
        let head = format!("{}:{}", &self.config.owner, source);

        let prs = self
            .client
            .pulls(&self.config.owner, &self.config.repo)
            .list()
            .head(head)
            .base(target)
            .state(octocrab::params::State::Open)
            .send()
            .await
            .map_err(map_octocrab)?;

        let result = prs.items.first().map(pr_from_octocrab);
        if let Some(ref pr) = result {
            debug!(pr_number = pr.number, "found existing PR");
        } else {
            debug!("no existing PR found");
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
        debug!(source, target, draft, "creating PR");
        let pulls = self.client.pulls(&self.config.owner, &self.config.repo);
        let pr = pulls
            .create(title, source, target)
            .draft(draft)
            .body(body)
            .send()
            .await
            .map_err(map_octocrab)?;

        let result = pr_from_octocrab(&pr);
        debug!(pr_number = result.number, "created PR");
        Ok(result)
    }

    async fn close_mr(&self, number: u64) -> Result<()> {
        debug!(pr_number = number, "closing PR");
        self.send(
            self.raw(Method::PATCH, &format!("/pulls/{number}"))
                .json(&serde_json::json!({ "state": "closed" })),
        )
        .await?;
        Ok(())
    }

    /// GitHub cannot rerun a workflow for an arbitrary ref, so an empty commit
    /// is pushed onto the PR head to start a fresh run
    async fn request_pipeline(&self, number: u64) -> Result<()> {
        debug!(pr_number = number, "triggering PR checks");
        let pr = self.get_pr(number).await?;
        let head_sha = pr.head.sha.clone();

        let parent: GitCommit = self
            .send(self.raw(Method::GET, &format!("/git/commits/{head_sha}")))
            .await?
            .json()
            .await?;

        let commit: GitCommit = self
            .send(self.raw(Method::POST, "/git/commits").json(&serde_json::json!({
                "message": "Trigger merge validation",
                "tree": parent.tree.sha,
                "parents": [parent.sha],
            })))
            .await?
            .json()
            .await?;

        self.send(
            self.raw(
                Method::PATCH,
                &format!("/git/refs/heads/{}", pr.head.ref_field),
            )
            .json(&serde_json::json!({ "sha": commit.sha, "force": false })),
        )
        .await?;
        debug!(pr_number = number, sha = %commit.sha, "pushed trigger commit");
        Ok(())
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<()> {
        debug!(pr_number = number, label, "adding label");
        self.client
            .issues(&self.config.owner, &self.config.repo)
            .add_labels(number, &[label.to_string()])
            .await
            .map_err(map_octocrab)?;
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        debug!(pr_number = number, label, "removing label");
        let path = format!("/issues/{number}/labels/{}", urlencoding::encode(label));
        match self.send(self.raw(Method::DELETE, &path)).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<()> {
        debug!(pr_number = number, "creating PR comment");
        self.client
            .issues(&self.config.owner, &self.config.repo)
            .create_comment(number, body)
            .await
            .map_err(map_octocrab)?;
        debug!(pr_number = number, "created PR comment");
        Ok(())
    }
}
