//! Check command - dry-run the readiness validator for one MR

use crate::cli::context::CommandContext;
use crate::cli::style::{Stylize, mr_status};
use anstream::println;
use anyhow::Result;
use merge_assist::readiness::{self, Verdict};
use merge_assist::store::Store;
use merge_assist::types::MrKey;
use std::path::Path;

/// Fetch an MR and print the verdict. Nothing is written anywhere.
pub async fn run_check(config: Option<&Path>, project: &str, mr: u64) -> Result<()> {
    let ctx = CommandContext::load(config)?;
    let project_config = ctx.project(project)?;
    let platform = ctx.platform(project_config)?;

    let snapshot = platform.get_mr_snapshot(mr).await?;
    let verdict = readiness::validate(&snapshot, &ctx.config.automation_user);

    println!(
        "{} {}",
        format!("{project}!{mr}").accent(),
        snapshot.title.emphasis()
    );
    println!(
        "  {} {} → {}",
        "branches:".muted(),
        snapshot.source_branch,
        snapshot.target_branch
    );
    if let Some(record) = ctx.store.load_mr(&MrKey::new(project, mr))? {
        println!(
            "  {} {} ({} strike(s))",
            "engine status:".muted(),
            mr_status(record.status),
            record.strikes
        );
    }

    match verdict {
        Verdict::Ready => println!("  {}", "✓ ready to merge".success()),
        Verdict::NotReady(reasons) => {
            println!("  {}", "✗ not ready".warn());
            for reason in reasons {
                println!("    - {reason}");
            }
        }
    }
    Ok(())
}
