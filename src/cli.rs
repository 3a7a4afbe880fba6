//! CLI parsing and command execution
//!
//! This module handles command-line argument parsing and routes commands to the appropriate handlers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::backends::Stores;
use crate::client::VaultClient;
use crate::config::Config;
use crate::scheduler::RotationScheduler;
use crate::service::VaultService;

#[derive(Parser)]
#[command(name = "rvault")]
#[command(about = "Credential vault that rotates each password a fixed delay after it is retrieved", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "VAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Store backend to use (memory or postgres, overrides config file)
    #[arg(long, env = "VAULT_STORE_BACKEND")]
    pub backend: Option<String>,

    /// Port to listen on (overrides config file)
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds between a retrieval and the rotation it triggers (overrides config file)
    #[arg(long)]
    pub rotation_delay: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "vault-config.toml")]
        output: PathBuf,
    },

    /// Run the vault HTTP server and rotation workers
    Serve,

    /// Store a new credential on a running server
    Create {
        username: String,

        #[arg(short, long)]
        password: String,

        /// Address of the vault server
        #[arg(long, env = "VAULT_SERVER", default_value = "http://127.0.0.1:8080")]
        server: String,
    },

    /// Retrieve a credential from a running server (schedules its rotation)
    Retrieve {
        username: String,

        /// Address of the vault server
        #[arg(long, env = "VAULT_SERVER", default_value = "http://127.0.0.1:8080")]
        server: String,
    },

    /// Show the rotation jobs recorded for a credential
    History {
        username: String,

        /// Address of the vault server
        #[arg(long, env = "VAULT_SERVER", default_value = "http://127.0.0.1:8080")]
        server: String,
    },
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => {
            Config::create_sample(&output)
                .with_context(|| format!("Failed to create sample config at {:?}", output))?;
            info!("Sample configuration created at {:?}", output);
        }

        Commands::Serve => {
            let mut config = if let Some(ref config_path) = cli.config {
                Config::from_file(config_path)
                    .with_context(|| format!("Failed to load config from {:?}", config_path))?
            } else {
                Config::from_env().context("Failed to load config from environment")?
            };

            // Override with CLI arguments if provided
            if let Some(backend) = cli.backend {
                config.store.backend = backend.to_lowercase();
            }
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(delay) = cli.rotation_delay {
                config.rotation.delay_seconds = delay;
            }

            config.validate().context("Invalid configuration")?;
            serve(config).await?;
        }

        Commands::Create {
            username,
            password,
            server,
        } => {
            let client = VaultClient::new(server)?;
            let created = client
                .create(&username, &password)
                .await
                .context("Failed to create credential")?;
            println!("✓ {} for '{}'", created.message, created.username);
        }

        Commands::Retrieve { username, server } => {
            let client = VaultClient::new(server)?;
            let retrieved = client
                .retrieve(&username)
                .await
                .context("Failed to retrieve credential")?;
            eprintln!("⚠️  WARNING: Secret value will be displayed. Ensure this output is secured.");
            println!("Username:  {}", retrieved.username);
            println!("Password:  {}", retrieved.password);
            println!("Retrieved: {}", retrieved.retrieved_time);
            match retrieved.rotation_due_at {
                Some(due_at) => println!("Rotates:   {}", due_at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => eprintln!("⚠️  Rotation could not be scheduled; check the server logs."),
            }
        }

        Commands::History { username, server } => {
            let client = VaultClient::new(server)?;
            let jobs = client
                .history(&username)
                .await
                .context("Failed to read rotation history")?;

            if jobs.is_empty() {
                println!("No rotations recorded for '{}'", username);
            } else {
                println!("Rotations for '{}':", username);
                for job in jobs {
                    println!(
                        "  - {} {:<9} due {} (version {}){}",
                        job.id,
                        job.status.as_str(),
                        job.due_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        job.based_on_version,
                        job.last_error
                            .map(|reason| format!(": {}", reason))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

/// Open the store, resume pending rotations, and serve HTTP until Ctrl-C
pub async fn serve(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .context("Invalid server address")?;

    // Store bootstrap failures abort before any traffic is accepted
    let stores = Stores::open(&config.store).await?;

    let scheduler = Arc::new(RotationScheduler::new(&stores, &config.rotation));
    scheduler
        .recover()
        .await
        .context("Failed to read outstanding rotation jobs")?;

    let shutdown = CancellationToken::new();
    let workers = scheduler.spawn(shutdown.clone());

    let service = Arc::new(VaultService::new(
        stores.credentials.clone(),
        stores.jobs.clone(),
        scheduler,
        config.rotation.delay(),
    ));
    let router = api::build_router(service);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(
        address = %addr,
        rotation_delay_seconds = config.rotation.delay_seconds,
        "Vault server running"
    );

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Shutdown signal listener failed: {}", e);
            }
        })
        .await
        .context("Vault server error");

    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Rotation worker ended abnormally: {}", e);
        }
    }
    info!("Vault server shutdown completed");

    served
}
