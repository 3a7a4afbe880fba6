//! Storage backends
//!
//! This module provides the credential and rotation-job store abstractions and
//! their implementations: an in-memory store for tests and local runs, and a
//! PostgreSQL store that survives restarts.

mod memory;
mod postgres;
mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    CredentialRecord, CredentialStore, FinishOutcome, FollowUp, JobClaim, JobOutcome, JobStatus,
    JobStore, RotationJob, ScheduleOutcome, StoreResult,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::StoreConfig;

/// Backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Memory,
    Postgres,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(BackendType::Memory),
            "postgres" | "postgresql" => Ok(BackendType::Postgres),
            _ => Err(format!(
                "Unknown store backend: {}. Supported: memory, postgres",
                s
            )),
        }
    }
}

/// The two store handles the vault runs on. Both usually point at the same backend.
#[derive(Clone)]
pub struct Stores {
    pub credentials: Arc<dyn CredentialStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            credentials: store.clone(),
            jobs: store,
        }
    }

    /// Open the configured backend. Connection or schema failures are fatal.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let backend: BackendType = config
            .backend
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        match backend {
            BackendType::Memory => {
                warn!("Using the in-memory store; credentials and pending rotations are lost on exit");
                Ok(Self::in_memory())
            }
            BackendType::Postgres => {
                let postgres_config = config.postgres.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "PostgreSQL configuration not found. Set VAULT_PG_* or configure [store.postgres] section"
                    )
                })?;
                let store = Arc::new(
                    PostgresStore::connect(postgres_config)
                        .await
                        .context("Failed to open PostgreSQL store")?,
                );
                info!("Using the {} store", store.backend_type());
                Ok(Self {
                    credentials: store.clone(),
                    jobs: store,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_from_str() {
        assert_eq!("memory".parse::<BackendType>(), Ok(BackendType::Memory));
        assert_eq!("Postgres".parse::<BackendType>(), Ok(BackendType::Postgres));
        assert_eq!("postgresql".parse::<BackendType>(), Ok(BackendType::Postgres));
        assert!("mongo".parse::<BackendType>().is_err());
    }

    #[tokio::test]
    async fn test_open_memory_backend() {
        let config = StoreConfig {
            backend: "memory".to_string(),
            postgres: None,
        };
        let stores = Stores::open(&config).await.unwrap();
        assert_eq!(stores.credentials.backend_type(), "memory");
    }

    #[tokio::test]
    async fn test_open_postgres_without_config_fails() {
        let config = StoreConfig {
            backend: "postgres".to_string(),
            postgres: None,
        };
        assert!(Stores::open(&config).await.is_err());
    }
}
