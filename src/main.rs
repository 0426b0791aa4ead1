//! usage-ledger CLI entry point.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use usage_ledger::config::{LedgerConfig, LogFormat};

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let config_path = args.config.clone().unwrap_or_else(LedgerConfig::path);
    let config = LedgerConfig::load_with_env(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let json_logs = args.json_logs || config.log_format == LogFormat::Json;
    init_tracing(json_logs);

    cli::quota::cmd_quota(args.command, &config).await
}

fn init_tracing(json_logs: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json_logs {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}
