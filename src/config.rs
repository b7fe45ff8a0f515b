//! Configuration loading and validation
//!
//! The config file is TOML. Engine-wide defaults live under `[engine]`;
//! each `[[projects]]` entry may override the batch size.

use crate::error::{Error, Result};
use crate::scheduler::PartialBatchPolicy;
use crate::types::{MergeMethod, Platform};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform config/data dirs
const APP_DIR: &str = "merge-assist";

/// Config filename
const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Username of the automation account MRs must be assigned to
    pub automation_user: String,
    /// Where the file store keeps state and audit log
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Engine-wide settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Label names
    #[serde(default)]
    pub labels: Labels,
    /// Managed projects
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

/// Engine-wide defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// MRs per batch
    pub batch_size: usize,
    /// Strikes tolerated before rejection
    pub strike_threshold: u32,
    /// How long a partial queue waits for a full batch
    pub max_queue_delay_secs: u64,
    /// What to do once the queue delay elapses
    pub partial_batch: PartialBatchPolicy,
    /// Per-MR pipeline wait bound
    pub pipeline_timeout_secs: u64,
    /// Proof pipeline wait bound
    pub proof_timeout_secs: u64,
    /// Delay between pipeline polls
    pub poll_interval_secs: u64,
    /// Scheduler cycle period for idle lanes
    pub tick_interval_secs: u64,
    /// How MRs are merged into the target
    pub merge_method: MergeMethod,
    /// Prefix of the per-lane batch branch
    pub batch_branch_prefix: String,
    /// Backoff for transient API failures
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            strike_threshold: 3,
            max_queue_delay_secs: 600,
            partial_batch: PartialBatchPolicy::default(),
            pipeline_timeout_secs: 1800,
            proof_timeout_secs: 1800,
            poll_interval_secs: 30,
            tick_interval_secs: 30,
            merge_method: MergeMethod::default(),
            batch_branch_prefix: "merge-assist/batch".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    /// First delay
    pub base_delay_ms: u64,
    /// Delay cap
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Label names applied to MRs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Labels {
    /// Seen by the engine
    pub recognized: String,
    /// Last verdict NotReady
    pub not_ready: String,
    /// Struck out
    pub rejected: String,
    /// Queued for merge
    pub ready_to_merge: String,
    /// Marks proof MRs
    pub batch_mr: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            recognized: "Merge Assist: Recognised for Merge".to_string(),
            not_ready: "Merge Assist: Not Ready for Merge".to_string(),
            rejected: "Merge Assist: Rejected".to_string(),
            ready_to_merge: "Merge Assist: Ready to Merge".to_string(),
            batch_mr: "Merge Assist: Batch Merge Request".to_string(),
        }
    }
}

/// A managed project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// GitHub or GitLab
    pub platform: Platform,
    /// Owner / group path
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Custom host (None for github.com/gitlab.com)
    #[serde(default)]
    pub host: Option<String>,
    /// Full API base URL override (e.g. `http://127.0.0.1:8080/api/v4`)
    #[serde(default)]
    pub api_url: Option<String>,
    /// Environment variable holding the API token
    #[serde(default)]
    pub token_env: Option<String>,
    /// Branches this project merges into; one lane each
    #[serde(default)]
    pub target_branches: Vec<String>,
    /// Per-project batch size override
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl ProjectConfig {
    /// Project path, the project half of every key
    pub fn path(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Name of the token env var, defaulting per platform
    pub fn token_var(&self) -> &str {
        self.token_env.as_deref().unwrap_or(match self.platform {
            Platform::GitHub => "GITHUB_TOKEN",
            Platform::GitLab => "GITLAB_TOKEN",
        })
    }

    /// Resolve lane settings for this project.
    ///
    /// Errors here are lane-fatal: the project is halted, the rest of the
    /// engine keeps running.
    pub fn lane_settings(&self, config: &Config) -> Result<LaneSettings> {
        if self.target_branches.is_empty() {
            return Err(Error::Config(format!(
                "project {} has no target branches configured",
                self.path()
            )));
        }
        if self.target_branches.iter().any(|b| b.trim().is_empty()) {
            return Err(Error::Config(format!(
                "project {} has an empty target branch name",
                self.path()
            )));
        }
        let batch_size = self.batch_size.unwrap_or(config.engine.batch_size);
        if batch_size == 0 {
            return Err(Error::Config(format!(
                "project {} has batch_size 0",
                self.path()
            )));
        }

        let engine = &config.engine;
        Ok(LaneSettings {
            automation_user: config.automation_user.clone(),
            batch_size,
            strike_threshold: engine.strike_threshold,
            max_queue_delay: Duration::from_secs(engine.max_queue_delay_secs),
            partial_batch: engine.partial_batch,
            pipeline_timeout: Duration::from_secs(engine.pipeline_timeout_secs),
            proof_timeout: Duration::from_secs(engine.proof_timeout_secs),
            poll_interval: Duration::from_secs(engine.poll_interval_secs),
            tick_interval: Duration::from_secs(engine.tick_interval_secs),
            merge_method: engine.merge_method,
            batch_branch_prefix: engine.batch_branch_prefix.clone(),
            labels: config.labels.clone(),
        })
    }
}

/// Fully resolved settings for one lane
#[derive(Debug, Clone)]
pub struct LaneSettings {
    /// Automation account username
    pub automation_user: String,
    /// MRs per batch
    pub batch_size: usize,
    /// Strikes tolerated before rejection
    pub strike_threshold: u32,
    /// Partial queue wait
    pub max_queue_delay: Duration,
    /// Partial queue policy
    pub partial_batch: PartialBatchPolicy,
    /// Per-MR pipeline wait bound
    pub pipeline_timeout: Duration,
    /// Proof pipeline wait bound
    pub proof_timeout: Duration,
    /// Poll period
    pub poll_interval: Duration,
    /// Idle tick period
    pub tick_interval: Duration,
    /// Merge method
    pub merge_method: MergeMethod,
    /// Batch branch prefix
    pub batch_branch_prefix: String,
    /// Label names
    pub labels: Labels,
}

impl Default for LaneSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            automation_user: "merge-assist".to_string(),
            batch_size: engine.batch_size,
            strike_threshold: engine.strike_threshold,
            max_queue_delay: Duration::from_secs(engine.max_queue_delay_secs),
            partial_batch: engine.partial_batch,
            pipeline_timeout: Duration::from_secs(engine.pipeline_timeout_secs),
            proof_timeout: Duration::from_secs(engine.proof_timeout_secs),
            poll_interval: Duration::from_secs(engine.poll_interval_secs),
            tick_interval: Duration::from_secs(engine.tick_interval_secs),
            merge_method: engine.merge_method,
            batch_branch_prefix: engine.batch_branch_prefix,
            labels: Labels::default(),
        }
    }
}

impl LaneSettings {
    /// Canonical batch branch for a target branch
    pub fn batch_branch(&self, target_branch: &str) -> String {
        format!("{}/{}", self.batch_branch_prefix, target_branch)
    }
}

impl Config {
    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
    }

    /// State directory, falling back to the platform data dir
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join(APP_DIR))
            .ok_or_else(|| Error::Config("no state_dir configured and no data dir".to_string()))
    }

    /// Engine-wide checks. Per-project problems are reported by
    /// [`ProjectConfig::lane_settings`] instead.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if self.automation_user.trim().is_empty() {
            return Err(Error::Config("automation_user must not be empty".to_string()));
        }
        if engine.batch_size == 0 {
            return Err(Error::Config("engine.batch_size must be at least 1".to_string()));
        }
        if engine.strike_threshold == 0 {
            return Err(Error::Config(
                "engine.strike_threshold must be at least 1".to_string(),
            ));
        }
        if engine.poll_interval_secs == 0 || engine.tick_interval_secs == 0 {
            return Err(Error::Config(
                "engine poll and tick intervals must be positive".to_string(),
            ));
        }
        if engine.pipeline_timeout_secs < engine.poll_interval_secs
            || engine.proof_timeout_secs < engine.poll_interval_secs
        {
            return Err(Error::Config(
                "pipeline timeouts must be at least one poll interval".to_string(),
            ));
        }
        if engine.batch_branch_prefix.trim_matches('/').is_empty() {
            return Err(Error::Config(
                "engine.batch_branch_prefix must not be empty".to_string(),
            ));
        }
        if engine.retry.base_delay_ms > engine.retry.max_delay_ms {
            return Err(Error::Config(
                "engine.retry.base_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for project in &self.projects {
            if !seen.insert(project.path()) {
                return Err(Error::Config(format!(
                    "project {} configured twice",
                    project.path()
                )));
            }
            if let Some(api_url) = &project.api_url {
                url::Url::parse(api_url).map_err(|e| {
                    Error::Config(format!("project {}: invalid api_url: {e}", project.path()))
                })?;
            }
        }
        Ok(())
    }

    /// Look up a project by path
    pub fn project(&self, path: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.path() == path)
    }
}
