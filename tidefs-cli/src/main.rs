//! Tidefs CLI - Command-line interface
//!
//! Tracks torrents in the record store and mounts them as a read-only
//! filesystem.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use tidefs_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "tidefs")]
#[command(about = "Mount BitTorrent content as a read-only filesystem")]
struct Cli {
    /// Record store location (defaults to ~/.tidefs/items.json)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    commands::handle_command(cli.command, cli.store).await?;

    Ok(())
}
