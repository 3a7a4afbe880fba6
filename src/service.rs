use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backends::{CredentialRecord, CredentialStore, JobStore, RotationJob};
use crate::error::VaultError;
use crate::scheduler::RotationScheduler;

/// The password handed out by a retrieval, plus what was scheduled because of it
#[derive(Debug, Clone, Serialize)]
pub struct Retrieval {
    pub username: String,
    pub password: String,
    pub version: i64,
    pub retrieved_at: DateTime<Utc>,
    /// When the rotation triggered by this read is due; `None` if it could not be scheduled
    pub rotation_due_at: Option<DateTime<Utc>>,
}

/// Create and retrieve credentials; every retrieval schedules a delayed rotation
pub struct VaultService {
    credentials: Arc<dyn CredentialStore>,
    jobs: Arc<dyn JobStore>,
    scheduler: Arc<RotationScheduler>,
    rotation_delay: Duration,
}

impl VaultService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        jobs: Arc<dyn JobStore>,
        scheduler: Arc<RotationScheduler>,
        rotation_delay: Duration,
    ) -> Self {
        Self {
            credentials,
            jobs,
            scheduler,
            rotation_delay,
        }
    }

    pub async fn create_credential(
        &self,
        username: &str,
        password: &str,
    ) -> Result<CredentialRecord, VaultError> {
        if username.is_empty() || password.is_empty() {
            return Err(VaultError::InvalidInput(
                "Username and password required".to_string(),
            ));
        }

        let record = self.credentials.create(username, password, Utc::now()).await?;
        info!("Created credential for '{}'", username);
        Ok(record)
    }

    /// Return the current password and schedule its rotation.
    ///
    /// The password and version come from a single read, so the scheduled job
    /// targets exactly the value handed out. A scheduling failure is logged and
    /// does not fail the retrieval.
    pub async fn retrieve_credential(&self, username: &str) -> Result<Retrieval, VaultError> {
        if username.is_empty() {
            return Err(VaultError::InvalidInput(
                "Username is required".to_string(),
            ));
        }

        let record = self.credentials.get(username).await?;
        let retrieved_at = Utc::now();

        let rotation_due_at = match self
            .scheduler
            .schedule(username, self.rotation_delay, record.version)
            .await
        {
            Ok(outcome) => Some(outcome.due_at()),
            Err(e) => {
                warn!(
                    "Rotation for '{}' was not scheduled; the password stays valid until the next retrieval: {}",
                    username, e
                );
                None
            }
        };

        Ok(Retrieval {
            username: record.username,
            password: record.password,
            version: record.version,
            retrieved_at,
            rotation_due_at,
        })
    }

    /// Rotation jobs for an existing credential, newest first
    pub async fn rotation_history(&self, username: &str) -> Result<Vec<RotationJob>, VaultError> {
        self.credentials.get(username).await?;
        Ok(self.jobs.history(username).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{JobStatus, MemoryStore, ScheduleOutcome, StoreResult, Stores};
    use crate::config::RotationConfig;
    use crate::error::StoreError;
    use std::time::Duration;
    use uuid::Uuid;

    fn service_over(stores: &Stores) -> VaultService {
        let scheduler = Arc::new(RotationScheduler::new(stores, &RotationConfig::default()));
        VaultService::new(
            stores.credentials.clone(),
            stores.jobs.clone(),
            scheduler,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_create_then_retrieve_round_trip() {
        let service = service_over(&Stores::in_memory());
        let created = service.create_credential("alice", "Init@123").await.unwrap();
        assert_eq!(created.version, 1);

        let retrieval = service.retrieve_credential("alice").await.unwrap();
        assert_eq!(retrieval.password, "Init@123");
        assert_eq!(retrieval.version, 1);
        assert!(retrieval.rotation_due_at.unwrap() > retrieval.retrieved_at);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_fields() {
        let service = service_over(&Stores::in_memory());
        assert!(matches!(
            service.create_credential("", "pw").await,
            Err(VaultError::InvalidInput(_))
        ));
        assert!(matches!(
            service.create_credential("alice", "").await,
            Err(VaultError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_create_is_conflict() {
        let service = service_over(&Stores::in_memory());
        service.create_credential("alice", "first").await.unwrap();
        assert!(matches!(
            service.create_credential("alice", "second").await,
            Err(VaultError::AlreadyExists(_))
        ));
        let retrieval = service.retrieve_credential("alice").await.unwrap();
        assert_eq!(retrieval.password, "first");
    }

    #[tokio::test]
    async fn test_create_does_not_schedule() {
        let stores = Stores::in_memory();
        let service = service_over(&stores);
        service.create_credential("alice", "Init@123").await.unwrap();
        assert!(stores.jobs.active_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_unknown_is_not_found() {
        let service = service_over(&Stores::in_memory());
        assert!(matches!(
            service.retrieve_credential("ghost").await,
            Err(VaultError::NotFound(_))
        ));
        assert!(matches!(
            service.rotation_history("ghost").await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retrieve_schedules_job_on_read_version() {
        let stores = Stores::in_memory();
        let service = service_over(&stores);
        service.create_credential("alice", "Init@123").await.unwrap();
        service.retrieve_credential("alice").await.unwrap();

        let history = service.rotation_history("alice").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Pending);
        assert_eq!(history[0].based_on_version, 1);
    }

    /// Job store that is always down
    struct DownJobs;

    #[async_trait::async_trait]
    impl JobStore for DownJobs {
        async fn enqueue(
            &self,
            _username: &str,
            _scheduled_at: DateTime<Utc>,
            _due_at: DateTime<Utc>,
            _based_on_version: i64,
        ) -> StoreResult<ScheduleOutcome> {
            Err(StoreError::Transient("job queue unreachable".into()))
        }

        async fn claim_due(
            &self,
            _now: DateTime<Utc>,
            _lease: Duration,
        ) -> StoreResult<Option<RotationJob>> {
            Err(StoreError::Transient("job queue unreachable".into()))
        }

        async fn finish(
            &self,
            _job_id: Uuid,
            _claim_token: Uuid,
            _outcome: &crate::backends::JobOutcome,
            _now: DateTime<Utc>,
        ) -> StoreResult<crate::backends::FinishOutcome> {
            Err(StoreError::Transient("job queue unreachable".into()))
        }

        async fn next_wakeup(&self) -> StoreResult<Option<DateTime<Utc>>> {
            Ok(None)
        }

        async fn job(&self, id: Uuid) -> StoreResult<RotationJob> {
            Err(StoreError::JobNotFound(id))
        }

        async fn history(&self, _username: &str) -> StoreResult<Vec<RotationJob>> {
            Ok(Vec::new())
        }

        async fn active_jobs(&self) -> StoreResult<Vec<RotationJob>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_retrieve_succeeds_when_scheduler_unavailable() {
        let stores = Stores {
            credentials: Arc::new(MemoryStore::new()),
            jobs: Arc::new(DownJobs),
        };
        let service = service_over(&stores);
        service.create_credential("alice", "Init@123").await.unwrap();

        let retrieval = service.retrieve_credential("alice").await.unwrap();
        assert_eq!(retrieval.password, "Init@123");
        assert!(retrieval.rotation_due_at.is_none());
    }
}
