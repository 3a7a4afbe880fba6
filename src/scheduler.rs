//! Durable delayed rotation.
//!
//! Jobs live in a [`JobStore`]; workers claim due jobs under a lease, execute
//! them with a version-checked update and record the terminal state. Nothing
//! about a scheduled rotation is held only in memory, so a restarted process
//! picks up where the previous one stopped.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backends::{
    CredentialStore, FinishOutcome, JobOutcome, JobStore, RotationJob, ScheduleOutcome,
    StoreResult, Stores,
};
use crate::config::RotationConfig;
use crate::error::{SchedulerError, StoreError};
use crate::rotation::{execute_rotation, PasswordGenerator, RetryPolicy};

const MIN_IDLE_WAIT: Duration = Duration::from_millis(10);

/// What a single dispatch pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// No job was claimable
    Idle,
    /// A job was executed and recorded
    Finished {
        job: RotationJob,
        follow_up: Option<RotationJob>,
    },
    /// The job ran but its lease had been taken over before it could be recorded
    LostClaim(RotationJob),
}

pub struct RotationScheduler {
    jobs: Arc<dyn JobStore>,
    credentials: Arc<dyn CredentialStore>,
    generator: PasswordGenerator,
    retry: RetryPolicy,
    lease: Duration,
    poll_interval: Duration,
    workers: usize,
    wake: Notify,
}

impl RotationScheduler {
    pub fn new(stores: &Stores, config: &RotationConfig) -> Self {
        Self {
            jobs: stores.jobs.clone(),
            credentials: stores.credentials.clone(),
            generator: PasswordGenerator::from_config(config),
            retry: RetryPolicy::from_config(config),
            lease: config.lease(),
            poll_interval: config.poll_interval(),
            workers: config.workers.max(1),
            wake: Notify::new(),
        }
    }

    /// Persist a rotation of `username` due after `delay`.
    ///
    /// An existing pending job is moved rather than duplicated; a running job
    /// gets the request as its follow-up.
    pub async fn schedule(
        &self,
        username: &str,
        delay: Duration,
        based_on_version: i64,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        let now = Utc::now();
        let due_at = now
            + chrono::Duration::from_std(delay)
                .map_err(|e| SchedulerError::Unavailable(StoreError::Backend(e.to_string())))?;

        // A concurrent first schedule on another connection surfaces as a transient conflict
        let outcome = self
            .retry
            .run("Scheduling rotation", || {
                self.jobs.enqueue(username, now, due_at, based_on_version)
            })
            .await
            .map_err(SchedulerError::Unavailable)?;

        debug!(
            job_id = %outcome.job().id,
            username,
            based_on_version,
            due_at = %outcome.due_at(),
            "Rotation {}",
            outcome.kind()
        );
        self.wake.notify_waiters();
        Ok(outcome)
    }

    /// Log the jobs left over from a previous run. Dispatch resumes them on its own.
    pub async fn recover(&self) -> StoreResult<Vec<RotationJob>> {
        let outstanding = self.jobs.active_jobs().await?;
        if outstanding.is_empty() {
            debug!("No outstanding rotation jobs");
        } else {
            info!("Recovered {} outstanding rotation job(s)", outstanding.len());
            for job in &outstanding {
                debug!(
                    job_id = %job.id,
                    username = %job.target_username,
                    status = %job.status,
                    due_at = %job.due_at,
                    "Outstanding rotation job"
                );
            }
        }
        Ok(outstanding)
    }

    /// Start the configured number of dispatch workers
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker| {
                let scheduler = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    /// Claim and execute due jobs until `shutdown` fires
    pub async fn run_worker(&self, worker: usize, shutdown: CancellationToken) {
        info!(worker, "Rotation worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Register interest before looking at the queue so a schedule() in between is not missed
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = match self.dispatch_once().await {
                Ok(Dispatch::Idle) => self.idle_wait().await,
                Ok(_) => continue,
                Err(e) => {
                    warn!(worker, "Rotation dispatch failed: {}", e);
                    self.poll_interval
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(worker, "Rotation worker stopped");
    }

    /// Claim one due job, if any, and run it to a terminal state
    pub async fn dispatch_once(&self) -> StoreResult<Dispatch> {
        let Some(job) = self.jobs.claim_due(Utc::now(), self.lease).await? else {
            return Ok(Dispatch::Idle);
        };
        let claim = job.claim.ok_or_else(|| {
            StoreError::Backend(format!("Claimed job {} carries no claim", job.id))
        })?;

        if job.attempts > 1 {
            info!(
                "Resuming rotation job {} for '{}' (claim {})",
                job.id, job.target_username, job.attempts
            );
        }

        let outcome = execute_rotation(
            self.credentials.as_ref(),
            &job,
            &self.generator,
            &self.retry,
        )
        .await;

        if let JobOutcome::Failed(reason) = &outcome {
            error!(
                job_id = %job.id,
                username = %job.target_username,
                "Rotation failed after {} attempt(s): {}",
                self.retry.max_attempts,
                reason
            );
        }

        let finished = self
            .retry
            .run("Recording rotation outcome", || {
                self.jobs.finish(job.id, claim.token, &outcome, Utc::now())
            })
            .await?;

        match finished {
            FinishOutcome::Finished { job, follow_up } => {
                debug!(job_id = %job.id, status = %job.status, "Rotation job finished");
                if let Some(next) = &follow_up {
                    info!(
                        "Follow-up rotation for '{}' due at {}",
                        next.target_username, next.due_at
                    );
                    self.wake.notify_waiters();
                }
                Ok(Dispatch::Finished { job, follow_up })
            }
            FinishOutcome::LostClaim => {
                warn!(
                    "Lease on rotation job {} for '{}' expired before it finished; another worker owns it",
                    job.id, job.target_username
                );
                Ok(Dispatch::LostClaim(job))
            }
        }
    }

    async fn idle_wait(&self) -> Duration {
        match self.jobs.next_wakeup().await {
            Ok(Some(at)) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_IDLE_WAIT, self.poll_interval.max(MIN_IDLE_WAIT)),
            Ok(None) => self.poll_interval,
            Err(e) => {
                warn!("Failed to look up next rotation: {}", e);
                self.poll_interval
            }
        }
    }
}
