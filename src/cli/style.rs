//! Terminal styling shared by the commands
//!
//! Output goes through `anstream`, which strips the escapes when stdout is
//! not a terminal, so styles can be applied unconditionally.

use merge_assist::types::{BatchStatus, MrStatus};
use owo_colors::OwoColorize;
use std::fmt::Display;

/// Semantic styles
pub trait Stylize: Display {
    /// Secondary information
    fn muted(&self) -> String {
        self.to_string().dimmed().to_string()
    }

    /// Headings
    fn emphasis(&self) -> String {
        self.to_string().bold().to_string()
    }

    /// Names and identifiers
    fn accent(&self) -> String {
        self.to_string().cyan().to_string()
    }

    /// Good news
    fn success(&self) -> String {
        self.to_string().green().to_string()
    }

    /// Problems
    fn warn(&self) -> String {
        self.to_string().yellow().to_string()
    }

    /// Failures
    fn error(&self) -> String {
        self.to_string().red().to_string()
    }
}

impl<T: Display + ?Sized> Stylize for T {}

/// Color an MR status by how it is doing
pub fn mr_status(status: MrStatus) -> String {
    match status {
        MrStatus::Queued | MrStatus::Merged => status.success(),
        MrStatus::InBatch | MrStatus::ReadyToFinalize | MrStatus::Merging => status.accent(),
        MrStatus::NotReady => status.warn(),
        MrStatus::Rejected => status.error(),
        MrStatus::Recognized | MrStatus::Closed => status.muted(),
    }
}

/// Color a batch status
pub fn batch_status(status: BatchStatus) -> String {
    match status {
        BatchStatus::Completed | BatchStatus::ProofSuccess => status.success(),
        BatchStatus::Failed | BatchStatus::ProofFailed => status.error(),
        _ => status.accent(),
    }
}
