//! Error types shared by the stores, the scheduler and the vault service.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by credential and job stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential already exists: {0}")]
    AlreadyExists(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    /// The record moved on since the caller read it. Never a user-facing error.
    #[error("version conflict for {username}: expected {expected}, found {actual}")]
    VersionConflict {
        username: String,
        expected: i64,
        actual: i64,
    },

    #[error("rotation job not found: {0}")]
    JobNotFound(Uuid),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the operation may succeed if simply attempted again
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.code() {
            Some(code) if *code == tokio_postgres::error::SqlState::UNIQUE_VIOLATION => {
                StoreError::AlreadyExists(
                    err.as_db_error()
                        .and_then(|db| db.detail())
                        .unwrap_or("unique constraint violated")
                        .to_string(),
                )
            }
            Some(code)
                if *code == tokio_postgres::error::SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == tokio_postgres::error::SqlState::T_R_DEADLOCK_DETECTED
                    || *code == tokio_postgres::error::SqlState::ADMIN_SHUTDOWN =>
            {
                StoreError::Transient(err.to_string())
            }
            Some(_) => StoreError::Backend(err.to_string()),
            // No SQLSTATE means the failure happened on the wire
            None => StoreError::Transient(err.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => StoreError::from(e),
            // Timeouts, a closed pool and hook failures may all clear up on their own
            other => StoreError::Transient(other.to_string()),
        }
    }
}

/// Errors returned by the rotation scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("rotation scheduler unavailable: {0}")]
    Unavailable(#[source] StoreError),
}

/// Errors surfaced by the vault service to its callers
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("username already exists: {0}")]
    AlreadyExists(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for VaultError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(username) => VaultError::AlreadyExists(username),
            StoreError::NotFound(username) => VaultError::NotFound(username),
            other => VaultError::Store(other),
        }
    }
}
