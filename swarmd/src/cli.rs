//! CLI command definitions

use clap::{Parser, Subcommand};

/// Swarmd - issue-to-PR agent swarm orchestrator
#[derive(Parser)]
#[command(name = "swarmd", about = "Issue-to-PR agent swarm orchestrator", version)]
pub struct Cli {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Subcommand to execute; defaults to `run`
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the orchestrator in the foreground
    Run,

    /// Print aggregate counters from the state store
    Status,

    /// Validate configuration, the target repository, and required CLIs
    Check,
}
