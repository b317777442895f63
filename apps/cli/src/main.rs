//! BatchScout CLI: research a batch of companies with bounded concurrency.
//!
//! Reads a JSON list of targets, runs each through discovery, selection,
//! extraction and aggregation on a shared pool of HTTP sessions, and shows
//! live per-job progress.

mod commands;
mod progress;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
