//! merge-assist - merge queue orchestration for GitLab and GitHub
//!
//! ## Commands
//!
//! - `run`: start the engine, reading MR events as JSON lines on stdin
//! - `check`: evaluate one MR without touching any state
//! - `status`: lanes, queues and active batches from the state file
//! - `audit`: show the audit log
//! - `reinstate`: clear a rejection

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "merge-assist")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Merge queue orchestration for GitLab and GitHub", long_about = None)]
struct Cli {
    /// Config file (default: platform config dir/merge-assist/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine; MR events are read from stdin, one JSON object per line
    Run,
    /// Evaluate an MR and print the verdict, without labels, comments or state
    Check {
        /// Project path (e.g. group/app)
        #[arg(short, long)]
        project: String,
        /// MR number
        mr: u64,
    },
    /// Show lanes, queued MRs and active batches
    Status,
    /// Show the audit log
    Audit {
        /// Only the most recent N entries
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Clear the rejection of an MR so it is evaluated again
    Reinstate {
        /// Project path (e.g. group/app)
        #[arg(short, long)]
        project: String,
        /// MR number
        mr: u64,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "merge_assist=debug"
    } else {
        "merge_assist=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run => cli::run_engine(config_path).await,
        Commands::Check { project, mr } => cli::run_check(config_path, &project, mr).await,
        Commands::Status => cli::run_status(config_path),
        Commands::Audit { limit } => cli::run_audit(config_path, limit),
        Commands::Reinstate { project, mr } => cli::run_reinstate(config_path, &project, mr),
    }
}
