//! # eremois-sync CLI Application
//!
//! Main entry point for the eremois-sync utility. Every command works on the
//! local store directly; peers exchange state over the P2P layer or through
//! exported snapshot files.

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eremois_sync::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eremois_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = match cli.command {
        Commands::Init { name } => cli::init(name).await,
        Commands::Id => cli::show_id().await,
        Commands::Key { command } => cli::key(command).await,
        Commands::Snapshot { out } => cli::snapshot(out).await,
        Commands::Apply { file } => cli::apply(file).await,
        Commands::Pending { command } => cli::pending(command).await,
        Commands::Status => cli::show_status().await,
        Commands::Simulate { devices, rounds } => cli::simulate(devices, rounds).await,
    } {
        eprintln!(
            "{} {}\n{}",
            "Error:".red().bold(),
            e.to_string().red(),
            "Tip: Run with --help for usage information.".yellow()
        );
        std::process::exit(1);
    }
    Ok(())
}
