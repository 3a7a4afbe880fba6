use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::store::{
    lease_expiry, CredentialRecord, CredentialStore, FinishOutcome, FollowUp, JobClaim,
    JobOutcome, JobStatus, JobStore, RotationJob, ScheduleOutcome, StoreResult,
};
use crate::error::StoreError;

/// Finished jobs kept per username; older ones are dropped
const FINISHED_JOBS_KEPT: usize = 100;

/// In-process credential and job store.
///
/// Every operation runs under a single lock, which makes each one atomic.
/// State lives as long as the value does, so sharing one `Arc<MemoryStore>`
/// between successive schedulers simulates a restart against durable storage.
#[derive(Default)]
pub struct MemoryStore {
    credentials: Mutex<HashMap<String, CredentialRecord>>,
    jobs: Mutex<JobTable>,
}

#[derive(Default)]
struct JobTable {
    /// The pending or running job of each username
    active: HashMap<String, RotationJob>,
    /// Terminal jobs per username, oldest first
    finished: HashMap<String, VecDeque<RotationJob>>,
}

impl JobTable {
    fn find(&self, id: Uuid) -> Option<&RotationJob> {
        self.active
            .values()
            .chain(self.finished.values().flatten())
            .find(|job| job.id == id)
    }

    fn retire(&mut self, job: RotationJob) {
        let kept = self.finished.entry(job.target_username.clone()).or_default();
        kept.push_back(job);
        while kept.len() > FINISHED_JOBS_KEPT {
            kept.pop_front();
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryStore {
    async fn create(
        &self,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CredentialRecord> {
        use std::collections::hash_map::Entry;

        let mut credentials = self.credentials.lock().await;
        match credentials.entry(username.to_string()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(username.to_string())),
            Entry::Vacant(slot) => {
                let record = CredentialRecord {
                    username: username.to_string(),
                    password: password.to_string(),
                    version: 1,
                    last_rotated: now,
                };
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn get(&self, username: &str) -> StoreResult<CredentialRecord> {
        self.credentials
            .lock()
            .await
            .get(username)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(username.to_string()))
    }

    async fn conditional_update(
        &self,
        username: &str,
        expected_version: i64,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CredentialRecord> {
        let mut credentials = self.credentials.lock().await;
        let record = credentials
            .get_mut(username)
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;

        if record.version != expected_version {
            return Err(StoreError::VersionConflict {
                username: username.to_string(),
                expected: expected_version,
                actual: record.version,
            });
        }

        record.password = new_password.to_string();
        record.last_rotated = now;
        record.version += 1;
        Ok(record.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(
        &self,
        username: &str,
        scheduled_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
        based_on_version: i64,
    ) -> StoreResult<ScheduleOutcome> {
        let mut table = self.jobs.lock().await;

        // Requests can arrive out of read order; the version never moves backwards
        if let Some(active) = table.active.get_mut(username) {
            return Ok(match active.status {
                JobStatus::Pending => {
                    active.scheduled_at = scheduled_at;
                    active.due_at = active.due_at.max(due_at);
                    active.based_on_version = active.based_on_version.max(based_on_version);
                    ScheduleOutcome::Coalesced(active.clone())
                }
                _ => {
                    let follow_up = match active.follow_up {
                        Some(existing) => FollowUp {
                            due_at: existing.due_at.max(due_at),
                            based_on_version: existing.based_on_version.max(based_on_version),
                        },
                        None => FollowUp {
                            due_at,
                            based_on_version,
                        },
                    };
                    active.follow_up = Some(follow_up);
                    ScheduleOutcome::Deferred(active.clone())
                }
            });
        }

        let job = RotationJob::pending(username, scheduled_at, due_at, based_on_version);
        table.active.insert(username.to_string(), job.clone());
        Ok(ScheduleOutcome::Created(job))
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<RotationJob>> {
        let mut table = self.jobs.lock().await;

        let Some(job) = table
            .active
            .values_mut()
            .filter(|job| job.is_claimable(now))
            .min_by_key(|job| job.due_at)
        else {
            return Ok(None);
        };

        if job.status == JobStatus::Running {
            debug!("Reclaiming job {} after lease expiry", job.id);
        }
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.claim = Some(JobClaim {
            token: Uuid::new_v4(),
            lease_expires_at: lease_expiry(now, lease),
        });
        Ok(Some(job.clone()))
    }

    async fn finish(
        &self,
        job_id: Uuid,
        claim_token: Uuid,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<FinishOutcome> {
        let mut table = self.jobs.lock().await;

        let username = match table.find(job_id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.claim.map(|claim| claim.token) == Some(claim_token) =>
            {
                job.target_username.clone()
            }
            Some(_) => return Ok(FinishOutcome::LostClaim),
            None => return Err(StoreError::JobNotFound(job_id)),
        };
        let mut job = table
            .active
            .remove(&username)
            .ok_or(StoreError::JobNotFound(job_id))?;

        job.status = outcome.status();
        job.claim = None;
        job.finished_at = Some(now);
        job.last_error = outcome.reason().map(str::to_string);
        let follow_up = job.follow_up.take().map(|follow_up| {
            RotationJob::pending(&username, now, follow_up.due_at, follow_up.based_on_version)
        });

        table.retire(job.clone());
        if let Some(ref next) = follow_up {
            table.active.insert(username, next.clone());
        }

        Ok(FinishOutcome::Finished {
            job,
            follow_up,
        })
    }

    async fn next_wakeup(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .jobs
            .lock()
            .await
            .active
            .values()
            .filter_map(RotationJob::wakeup_at)
            .min())
    }

    async fn job(&self, id: Uuid) -> StoreResult<RotationJob> {
        self.jobs
            .lock()
            .await
            .find(id)
            .cloned()
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn history(&self, username: &str) -> StoreResult<Vec<RotationJob>> {
        let table = self.jobs.lock().await;
        // The active job is always newer than every finished one
        Ok(table
            .active
            .get(username)
            .into_iter()
            .chain(table.finished.get(username).into_iter().flat_map(|kept| kept.iter().rev()))
            .cloned()
            .collect())
    }

    async fn active_jobs(&self) -> StoreResult<Vec<RotationJob>> {
        let mut active: Vec<RotationJob> =
            self.jobs.lock().await.active.values().cloned().collect();
        active.sort_by_key(|job| job.due_at);
        Ok(active)
    }
}
