//! Rotating Credential Vault Library
//!
//! A credential vault that hands out the current password and rotates it a
//! fixed delay after every retrieval, using version-checked updates and a
//! durable job queue.

pub mod api;
pub mod backends;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod rotation;
pub mod scheduler;
pub mod service;

pub use backends::Stores;
pub use config::Config;
pub use error::{SchedulerError, StoreError, VaultError};
pub use rotation::PasswordGenerator;
pub use scheduler::RotationScheduler;
pub use service::{Retrieval, VaultService};
