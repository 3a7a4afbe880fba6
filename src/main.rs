//! Rotating Credential Vault CLI
//!
//! This is the main entry point for the CLI application.

use anyhow::Result;
use clap::Parser;
use rotating_vault::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI arguments
    let cli = cli::Cli::parse();

    // Execute the command
    cli::execute(cli).await
}
