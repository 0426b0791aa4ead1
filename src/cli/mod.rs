//! Command-line interface definitions.

pub(crate) mod quota;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "usage-ledger")]
#[command(version)]
#[command(about = "Per-subject daily usage metering and soft quota accounting")]
pub(crate) struct Cli {
    /// Path to config.json (default: ~/.usage-ledger/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Show every stored usage record
    Status,
    /// Check whether a subject may consume more units today
    Check {
        /// Subject identifier (user id, API key, ...)
        subject: String,
        /// Override the configured daily limit
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Record consumption for a subject
    Record {
        /// Subject identifier (user id, API key, ...)
        subject: String,
        /// Units consumed (at least 1)
        units: u64,
        /// Override the configured daily limit
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Print the effective configuration
    Config,
}
