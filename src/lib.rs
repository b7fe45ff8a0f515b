//! merge-assist - merge queue orchestration for GitLab and GitHub
//!
//! MRs assigned to the automation account are validated, queued per
//! (project, target branch) lane, and merged either one at a time or in
//! batches validated by a single proof pipeline. Repeated readiness failures
//! earn strikes; too many strikes reject the MR until an operator reinstates
//! it.
//!
//! The pure parts ([`readiness`], [`strikes`], [`scheduler`]) hold the
//! policy. [`lane`] and [`batch`] drive the remote through a
//! [`platform::PlatformService`] and persist through a [`store::Store`].

pub mod batch;
pub mod comments;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lane;
pub mod platform;
pub mod readiness;
pub mod scheduler;
pub mod store;
pub mod strikes;
pub mod types;
pub mod wait;

pub use error::{Error, Result};
