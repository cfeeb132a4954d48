mod auth;
mod cli;
mod collectors;
mod config;
mod error;
mod exporter;
mod fields;
mod metrics;
mod providers;
mod refresher;
mod server;
mod state;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    info!("Starting GitHub Actions exporter {}", env!("CARGO_PKG_VERSION"));
    cli.execute().await?;

    Ok(())
}
