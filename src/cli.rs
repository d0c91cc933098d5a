use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chainflow", version, about = "Run dependency-ordered, chained AI agent workflows")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a workflow file
    Run {
        /// Workflow document (TOML)
        workflow: PathBuf,

        /// Directory agents run in
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Maximum number of agents running at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Per-task timeout in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,

        /// Path to config file (overrides default search)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory for per-invocation JSONL stream logs
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a workflow file without running it
    Validate {
        /// Workflow document (TOML)
        workflow: PathBuf,
    },
    /// Report whether the agent program looks installed and logged in
    Availability,
}
