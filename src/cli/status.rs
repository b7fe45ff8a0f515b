//! Status command - what the engine state file says

use crate::cli::context::CommandContext;
use crate::cli::style::{Stylize, batch_status, mr_status};
use anstream::println;
use anyhow::Result;
use merge_assist::scheduler::order_queue;
use merge_assist::store::Store;
use merge_assist::types::{LaneKey, MergeRequestRecord, MrStatus};
use std::path::Path;

/// Print every configured lane with its records and active batch
pub fn run_status(config: Option<&Path>) -> Result<()> {
    let ctx = CommandContext::load(config)?;
    let store = ctx.store.as_ref();

    if ctx.config.projects.is_empty() {
        println!("{}", "No projects configured.".muted());
        return Ok(());
    }

    for project in &ctx.config.projects {
        let settings = match project.lane_settings(&ctx.config) {
            Ok(settings) => settings,
            Err(e) => {
                println!("{} {}", project.path().accent(), format!("halted: {e}").error());
                continue;
            }
        };

        for target in &project.target_branches {
            let lane = LaneKey::new(project.path(), target.clone());
            println!("{}", lane.to_string().emphasis());

            if let Some(batch) = store.active_batch(&lane)? {
                let proof = batch
                    .proof_mr
                    .map_or_else(String::new, |n| format!(" proof !{n}"));
                println!(
                    "  {} {} ({} members){}",
                    "batch".muted(),
                    batch_status(batch.status),
                    batch.members.len(),
                    proof
                );
            }

            let records = store.lane_mrs(&lane)?;
            if records.is_empty() {
                println!("  {}", "no MRs".muted());
                continue;
            }

            let queued: Vec<MergeRequestRecord> = records
                .iter()
                .filter(|r| r.status == MrStatus::Queued)
                .cloned()
                .collect();
            for (position, record) in order_queue(&queued, settings.batch_size).iter().enumerate() {
                println!("  {:>2}. {}", position + 1, describe(record));
            }
            for record in records.iter().filter(|r| r.status != MrStatus::Queued) {
                println!("      {}", describe(record));
            }
        }
    }

    let rejected = store
        .archived_mrs()?
        .into_iter()
        .filter(|r| r.status == MrStatus::Rejected)
        .count();
    if rejected > 0 {
        println!();
        println!(
            "{}",
            format!("{rejected} rejected MR(s) waiting for reinstatement").warn()
        );
    }
    Ok(())
}

fn describe(record: &MergeRequestRecord) -> String {
    let mut line = format!(
        "{} {} {}",
        format!("!{}", record.key.number).accent(),
        mr_status(record.status),
        record.title
    );
    if record.strikes > 0 {
        line.push_str(&format!(" ({} strike(s))", record.strikes).warn());
    }
    if record.priority != 0 {
        line.push_str(&format!(" [priority {}]", record.priority).muted());
    }
    line
}
