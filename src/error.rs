//! Error types for merge-assist

use thiserror::Error;

/// Errors produced by the orchestration core and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// GitLab API returned an error response
    #[error("GitLab API error: {0}")]
    GitLabApi(String),

    /// GitHub API returned an error response
    #[error("GitHub API error: {0}")]
    GitHubApi(String),

    /// Generic platform error (used by test doubles and shared helpers)
    #[error("platform error: {0}")]
    Platform(String),

    /// Remote asked us to slow down
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network hiccup or 5xx from the remote; safe to retry
    #[error("transient API failure: {0}")]
    Transient(String),

    /// Requested remote object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(String),

    /// Operation not allowed in the record's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A wait was interrupted by shutdown
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Octocrab error
    #[error("GitHub client error: {0}")]
    Octocrab(#[from] octocrab::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is worth retrying with backoff.
    ///
    /// Pipeline outcomes never come through here: they are results, not errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::RateLimited(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Whether the failure should halt the affected lane
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Result type alias for merge-assist
pub type Result<T> = std::result::Result<T, Error>;
