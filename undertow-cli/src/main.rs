//! Undertow CLI - Command-line interface
//!
//! Runs the Undertow node and offers offline torrent utilities.

mod commands;

use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Anonymous BitTorrent distribution node")]
struct Cli {
    /// Console log level; RUST_LOG takes precedence when set
    #[arg(long, global = true, default_value = "info")]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command).await
}
