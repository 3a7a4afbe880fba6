use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A stored username/password pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub username: String,
    pub password: String,
    /// Starts at 1 and is bumped by every password change
    pub version: i64,
    pub last_rotated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Exclusive, time-bounded ownership of a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobClaim {
    pub token: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

/// A scheduling request that arrived while the job was already running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUp {
    pub due_at: DateTime<Utc>,
    pub based_on_version: i64,
}

/// A durable "rotate this credential at `due_at`" request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationJob {
    pub id: Uuid,
    pub target_username: String,
    pub scheduled_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub based_on_version: i64,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim: Option<JobClaim>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<FollowUp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RotationJob {
    pub fn pending(
        username: &str,
        scheduled_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
        based_on_version: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_username: username.to_string(),
            scheduled_at,
            due_at,
            based_on_version,
            status: JobStatus::Pending,
            attempts: 0,
            claim: None,
            follow_up: None,
            finished_at: None,
            last_error: None,
        }
    }

    /// Whether a worker may claim this job at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.due_at <= now,
            JobStatus::Running => self
                .claim
                .map(|claim| claim.lease_expires_at <= now)
                .unwrap_or(true),
            _ => false,
        }
    }

    /// The instant at which this job next becomes claimable, if ever
    pub fn wakeup_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            JobStatus::Pending => Some(self.due_at),
            JobStatus::Running => self.claim.map(|claim| claim.lease_expires_at),
            _ => None,
        }
    }
}

/// What `JobStore::enqueue` did with a scheduling request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// No active job existed; a new pending job was stored
    Created(RotationJob),
    /// The pending job was moved to the new due time and version
    Coalesced(RotationJob),
    /// A job is running; the request was recorded as its follow-up
    Deferred(RotationJob),
}

impl ScheduleOutcome {
    pub fn job(&self) -> &RotationJob {
        match self {
            ScheduleOutcome::Created(job)
            | ScheduleOutcome::Coalesced(job)
            | ScheduleOutcome::Deferred(job) => job,
        }
    }

    /// When the rotation covering this request is expected to run
    pub fn due_at(&self) -> DateTime<Utc> {
        match self {
            ScheduleOutcome::Deferred(job) => job
                .follow_up
                .map(|follow_up| follow_up.due_at)
                .unwrap_or(job.due_at),
            other => other.job().due_at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleOutcome::Created(_) => "created",
            ScheduleOutcome::Coalesced(_) => "coalesced",
            ScheduleOutcome::Deferred(_) => "deferred",
        }
    }
}

/// Terminal result of executing a claimed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled(String),
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Cancelled(_) => JobStatus::Cancelled,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            JobOutcome::Completed => None,
            JobOutcome::Cancelled(reason) | JobOutcome::Failed(reason) => Some(reason),
        }
    }
}

/// Result of `JobStore::finish`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The job is now terminal; a follow-up, if one was recorded, is now pending
    Finished {
        job: RotationJob,
        follow_up: Option<RotationJob>,
    },
    /// The claim token no longer matches: the lease expired and someone else took the job
    LostClaim,
}

/// Durable credential storage.
///
/// Creation relies on the store's uniqueness constraint and every password
/// change is a compare-and-swap on `version`; there is no other write path.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert a new record with version 1
    async fn create(
        &self,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CredentialRecord>;

    /// Point lookup by username
    async fn get(&self, username: &str) -> StoreResult<CredentialRecord>;

    /// Replace the password only if the stored version equals `expected_version`
    async fn conditional_update(
        &self,
        username: &str,
        expected_version: i64,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CredentialRecord>;

    /// Get the backend type name for display purposes
    fn backend_type(&self) -> &'static str;
}

/// Durable queue of rotation jobs with at most one active job per username
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Create, coalesce into, or defer behind the username's active job
    async fn enqueue(
        &self,
        username: &str,
        scheduled_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
        based_on_version: i64,
    ) -> StoreResult<ScheduleOutcome>;

    /// Atomically claim the earliest claimable job, if any
    async fn claim_due(&self, now: DateTime<Utc>, lease: Duration)
        -> StoreResult<Option<RotationJob>>;

    /// Move a claimed job to its terminal state, fenced by the claim token
    async fn finish(
        &self,
        job_id: Uuid,
        claim_token: Uuid,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<FinishOutcome>;

    /// Earliest due time or lease expiry among active jobs
    async fn next_wakeup(&self) -> StoreResult<Option<DateTime<Utc>>>;

    async fn job(&self, id: Uuid) -> StoreResult<RotationJob>;

    /// All jobs for a username, newest first
    async fn history(&self, username: &str) -> StoreResult<Vec<RotationJob>>;

    /// Pending and running jobs, oldest due first
    async fn active_jobs(&self) -> StoreResult<Vec<RotationJob>>;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365))
}
