//! Shared command context for CLI commands
//!
//! Loads the config and opens the state directory. Platform services are
//! built on demand since only `run` and `check` talk to a remote.

use anyhow::{Context, Result, anyhow};
use merge_assist::config::{Config, ProjectConfig};
use merge_assist::platform::{PlatformService, RetryPolicy, create_platform_service};
use merge_assist::store::FileStore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Config plus the file store it points at
pub struct CommandContext {
    /// Validated configuration
    pub config: Config,
    /// State directory store
    pub store: Arc<FileStore>,
}

impl CommandContext {
    /// Load config from `path` (or the default location) and open the store
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Config::default_path()
                .ok_or_else(|| anyhow!("no config dir on this platform, pass --config"))?,
        };
        let config = Config::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;

        let state_dir = config.state_dir()?;
        let store = FileStore::open(&state_dir)
            .with_context(|| format!("failed to open state in {}", state_dir.display()))?;

        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    /// Look up a configured project
    pub fn project(&self, path: &str) -> Result<&ProjectConfig> {
        self.config
            .project(path)
            .ok_or_else(|| anyhow!("project {path} is not configured"))
    }

    /// Retry policy from `[engine.retry]`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(self.config.engine.retry)
    }

    /// Remote for one project
    pub fn platform(&self, project: &ProjectConfig) -> Result<Arc<dyn PlatformService>> {
        create_platform_service(project, self.retry_policy())
            .with_context(|| format!("failed to connect to {}", project.path()))
    }

    /// Remotes for every project that could be set up.
    ///
    /// Projects left out are halted by the engine.
    pub fn platforms(&self) -> HashMap<String, Arc<dyn PlatformService>> {
        let mut platforms = HashMap::new();
        for project in &self.config.projects {
            match create_platform_service(project, self.retry_policy()) {
                Ok(platform) => {
                    platforms.insert(project.path(), platform);
                }
                Err(e) => warn!(project = %project.path(), error = %e, "platform unavailable"),
            }
        }
        platforms
    }
}
