use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::rotation::DEFAULT_CHARSET;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_backend")]
    pub backend: String,
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    /// Maximum number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Delay between a retrieval and the rotation it schedules
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: u64,
    #[serde(default = "default_password_length")]
    pub password_length: usize,
    #[serde(default = "default_charset")]
    pub charset: String,
    /// How long a claimed job is owned before another worker may take it
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// Upper bound on how long an idle worker sleeps between scans
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Store attempts per rotation before the job is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_database() -> String {
    "vault".to_string()
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_pool_size() -> usize {
    8
}

fn default_delay_seconds() -> u64 {
    10
}

fn default_password_length() -> usize {
    12
}

fn default_charset() -> String {
    DEFAULT_CHARSET.to_string()
}

fn default_lease_seconds() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_workers() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            postgres: None,
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            delay_seconds: default_delay_seconds(),
            password_length: default_password_length(),
            charset: default_charset(),
            lease_seconds: default_lease_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl RotationConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            bind_address: std::env::var("VAULT_BIND_ADDRESS")
                .unwrap_or_else(|_| default_bind_address()),
            port: parse_env("VAULT_PORT")?.unwrap_or_else(default_port),
        };

        let postgres = match std::env::var("VAULT_PG_HOST") {
            Ok(host) => Some(PostgresConfig {
                host,
                port: parse_env("VAULT_PG_PORT")?.unwrap_or_else(default_postgres_port),
                username: std::env::var("VAULT_PG_USER")
                    .context("VAULT_PG_USER environment variable not set")?,
                password: std::env::var("VAULT_PG_PASSWORD")
                    .context("VAULT_PG_PASSWORD environment variable not set")?,
                database: std::env::var("VAULT_PG_DATABASE").unwrap_or_else(|_| default_database()),
                ssl_mode: std::env::var("VAULT_PG_SSLMODE").unwrap_or_else(|_| default_ssl_mode()),
                pool_size: parse_env("VAULT_PG_POOL_SIZE")?.unwrap_or_else(default_pool_size),
            }),
            Err(_) => None,
        };

        let store = StoreConfig {
            // Pointing at a database implies using it
            backend: std::env::var("VAULT_STORE_BACKEND").unwrap_or_else(|_| {
                if postgres.is_some() {
                    "postgres".to_string()
                } else {
                    default_backend()
                }
            }),
            postgres,
        };

        let rotation = RotationConfig {
            delay_seconds: parse_env("ROTATION_DELAY_SECONDS")?
                .unwrap_or_else(default_delay_seconds),
            password_length: parse_env("PASSWORD_LENGTH")?.unwrap_or_else(default_password_length),
            ..RotationConfig::default()
        };

        Ok(Self {
            server,
            store,
            rotation,
        })
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        self.store
            .backend
            .parse::<crate::backends::BackendType>()
            .map_err(|e| anyhow::anyhow!(e))?;
        if let Some(postgres) = &self.store.postgres {
            ensure!(
                postgres.pool_size > 0,
                "store.postgres.pool_size must be at least 1"
            );
        }
        ensure!(
            self.rotation.password_length > 0,
            "rotation.password_length must be greater than zero"
        );
        ensure!(
            !self.rotation.charset.is_empty(),
            "rotation.charset must not be empty"
        );
        ensure!(
            self.rotation.lease_seconds > 0,
            "rotation.lease_seconds must be greater than zero"
        );
        ensure!(
            self.rotation.poll_interval_ms > 0,
            "rotation.poll_interval_ms must be greater than zero"
        );
        ensure!(
            self.rotation.workers > 0,
            "rotation.workers must be at least 1"
        );
        ensure!(
            self.rotation.max_attempts > 0,
            "rotation.max_attempts must be at least 1"
        );
        Ok(())
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let sample = Self {
            server: ServerConfig::default(),
            store: StoreConfig {
                backend: "postgres".to_string(),
                postgres: Some(PostgresConfig {
                    host: "localhost".to_string(),
                    port: default_postgres_port(),
                    username: "vault".to_string(),
                    password: "your-database-password-here".to_string(),
                    database: default_database(),
                    ssl_mode: default_ssl_mode(),
                    pool_size: default_pool_size(),
                }),
            },
            rotation: RotationConfig::default(),
        };

        let toml_string =
            toml::to_string_pretty(&sample).context("Failed to serialize sample config")?;
        fs::write(path.as_ref(), toml_string)
            .with_context(|| format!("Failed to write sample config to {:?}", path.as_ref()))?;

        Ok(())
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", name, e)),
        Err(_) => Ok(None),
    }
}
