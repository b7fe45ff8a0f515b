//! Platform service construction from project configuration

use super::{GitHubService, GitLabService, PlatformService, RetryPolicy, RetryingPlatform};
use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::types::Platform;
use std::sync::Arc;
use tracing::debug;

/// Build the service for a project, wrapped in transient-failure retries.
///
/// The API token is read from the project's token environment variable.
/// A missing token is a configuration error and halts only this project.
pub fn create_platform_service(
    project: &ProjectConfig,
    retry: RetryPolicy,
) -> Result<Arc<dyn PlatformService>> {
    let var = project.token_var();
    let token = std::env::var(var)
        .ok()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "project {}: environment variable {var} is not set",
                project.path()
            ))
        })?;

    debug!(project = %project.path(), platform = %project.platform, "creating platform service");

    let inner: Arc<dyn PlatformService> = match project.platform {
        Platform::GitHub => {
            let service = match &project.api_url {
                Some(api_url) => GitHubService::with_api_base(
                    &token,
                    project.owner.clone(),
                    project.repo.clone(),
                    project.host.clone(),
                    api_url.clone(),
                )?,
                None => GitHubService::new(
                    &token,
                    project.owner.clone(),
                    project.repo.clone(),
                    project.host.clone(),
                )?,
            };
            Arc::new(service)
        }
        Platform::GitLab => {
            let service = match &project.api_url {
                Some(api_url) => GitLabService::with_api_base(
                    token,
                    project.owner.clone(),
                    project.repo.clone(),
                    project.host.clone(),
                    api_url.clone(),
                )?,
                None => GitLabService::new(
                    token,
                    project.owner.clone(),
                    project.repo.clone(),
                    project.host.clone(),
                )?,
            };
            Arc::new(service)
        }
    };

    Ok(Arc::new(RetryingPlatform::new(inner, retry)))
}
