//! Reinstate command - clear a rejection
//!
//! Works on the state file directly. The rejected label is left on the MR
//! and removed the next time the engine evaluates it.

use crate::cli::context::CommandContext;
use crate::cli::style::Stylize;
use anstream::println;
use anyhow::Result;
use merge_assist::lane::reinstate_record;
use merge_assist::types::MrKey;
use std::path::Path;

/// Move a rejected MR back to recognized with no strikes
pub fn run_reinstate(config: Option<&Path>, project: &str, mr: u64) -> Result<()> {
    let ctx = CommandContext::load(config)?;
    ctx.project(project)?;

    let key = MrKey::new(project, mr);
    let record = reinstate_record(ctx.store.as_ref(), &key)?;
    println!(
        "{} {} {}",
        "✓".success(),
        key.to_string().accent(),
        format!("reinstated, will be evaluated on its next event ({})", record.title).muted()
    );
    Ok(())
}
