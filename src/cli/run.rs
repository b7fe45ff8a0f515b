//! Run command - the engine, fed MR events on stdin

use crate::cli::context::CommandContext;
use anyhow::Result;
use merge_assist::engine::{Engine, Submission};
use merge_assist::store::Store;
use merge_assist::types::MrEvent;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Run the engine until stdin closes or Ctrl-C.
///
/// Each stdin line is one event: `{"project": "group/app", "mr": 42}`.
/// On end of input the lanes finish their queued work before exiting.
pub async fn run_engine(config: Option<&Path>) -> Result<()> {
    let ctx = CommandContext::load(config)?;
    let platforms = ctx.platforms();
    let store: Arc<dyn Store> = ctx.store.clone();
    let engine = Engine::start(&ctx.config, platforms, store);

    for (project, reason) in engine.halted_projects() {
        warn!(project, reason, "project halted");
    }
    info!(lanes = engine.lanes().len(), "engine running, reading events from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                break true;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break false };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let event: MrEvent = match serde_json::from_str(line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, line, "ignoring malformed event");
                        continue;
                    }
                };
                match engine.submit(&event).await {
                    Ok(Submission::Routed(lane)) => debug!(mr = %event.key(), %lane, "routed"),
                    Ok(Submission::Coalesced(lane)) => debug!(mr = %event.key(), %lane, "coalesced"),
                    Ok(Submission::Ignored(reason)) => info!(mr = %event.key(), reason, "event ignored"),
                    Err(e) => warn!(mr = %event.key(), error = %e, "failed to route event"),
                }
            }
        }
    };

    if interrupted {
        info!("interrupted, cancelling in-flight work");
        engine.shutdown().await;
    } else {
        info!("input closed, finishing queued work");
        engine.drain().await;
    }
    Ok(())
}
