//! Audit command - print the audit log

use crate::cli::context::CommandContext;
use crate::cli::style::Stylize;
use anstream::println;
use anyhow::Result;
use merge_assist::store::Store;
use std::path::Path;

/// Print audit entries, oldest first
pub fn run_audit(config: Option<&Path>, limit: Option<usize>) -> Result<()> {
    let ctx = CommandContext::load(config)?;
    let entries = ctx.store.audit_log(limit)?;

    if entries.is_empty() {
        println!("{}", "Audit log is empty.".muted());
        return Ok(());
    }

    for entry in entries {
        let reason = entry
            .reason
            .map_or_else(String::new, |r| format!(" - {r}"));
        println!(
            "{} {} {}{}",
            entry.at.format("%Y-%m-%d %H:%M:%S").to_string().muted(),
            entry.subject.to_string().accent(),
            entry.action.emphasis(),
            reason
        );
    }
    Ok(())
}
