use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::store::{
    lease_expiry, CredentialRecord, CredentialStore, FinishOutcome, FollowUp, JobClaim,
    JobOutcome, JobStatus, JobStore, RotationJob, ScheduleOutcome, StoreResult,
};
use crate::config::PostgresConfig;
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    username TEXT PRIMARY KEY,
    password TEXT NOT NULL,
    version BIGINT NOT NULL,
    last_rotated TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS rotation_jobs (
    id UUID PRIMARY KEY,
    target_username TEXT NOT NULL,
    scheduled_at TIMESTAMPTZ NOT NULL,
    due_at TIMESTAMPTZ NOT NULL,
    based_on_version BIGINT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    claim_token UUID,
    lease_expires_at TIMESTAMPTZ,
    follow_up_due_at TIMESTAMPTZ,
    follow_up_version BIGINT,
    finished_at TIMESTAMPTZ,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS rotation_jobs_dispatch
    ON rotation_jobs (status, due_at);

CREATE UNIQUE INDEX IF NOT EXISTS rotation_jobs_one_active
    ON rotation_jobs (target_username)
    WHERE status IN ('pending', 'running');
"#;

const CREDENTIAL_COLUMNS: &str = "username, password, version, last_rotated";

const JOB_COLUMNS: &str = "id, target_username, scheduled_at, due_at, based_on_version, \
     status, attempts, claim_token, lease_expires_at, follow_up_due_at, follow_up_version, \
     finished_at, last_error";

// GREATEST skips NULLs, so a missing follow-up takes the incoming values as-is.
// Neither branch may move the version backwards: requests can land out of read order.
const COALESCE_PENDING: &str = "UPDATE rotation_jobs \
     SET scheduled_at = $2, due_at = GREATEST(due_at, $3), \
         based_on_version = GREATEST(based_on_version, $4) \
     WHERE id = $1";

const RECORD_FOLLOW_UP: &str = "UPDATE rotation_jobs \
     SET follow_up_due_at = GREATEST(follow_up_due_at, $2), \
         follow_up_version = GREATEST(follow_up_version, $3) \
     WHERE id = $1";

/// PostgreSQL-backed credential and job store
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Build the connection pool and make sure the tables and indexes exist
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!(
            "Connecting to PostgreSQL at {}:{}",
            config.host, config.port
        );

        let connection_string = Self::build_connection_string(
            &config.host,
            config.port,
            &config.username,
            &config.password,
            &config.database,
            &config.ssl_mode,
        );
        let pg_config: tokio_postgres::Config = connection_string
            .parse()
            .context("Invalid PostgreSQL connection settings")?;

        // Fast recycling still drops connections whose socket has closed
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .context("Failed to build PostgreSQL connection pool")?;

        pool.get()
            .await
            .context("Failed to connect to PostgreSQL")?
            .query_one("SELECT version()", &[])
            .await
            .context("Failed to verify PostgreSQL connection")?;

        let store = Self { pool };
        store.ensure_schema().await?;

        info!(
            pool_size = config.pool_size,
            "Successfully connected to PostgreSQL"
        );
        Ok(store)
    }

    /// Create tables, the dispatch index and the one-active-job index
    pub async fn ensure_schema(&self) -> Result<()> {
        self.pool
            .get()
            .await
            .context("Failed to check out a PostgreSQL connection")?
            .batch_execute(SCHEMA)
            .await
            .context("Failed to create vault schema")?;
        debug!("Vault schema is in place");
        Ok(())
    }

    /// Build PostgreSQL connection string
    fn build_connection_string(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
        ssl_mode: &str,
    ) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode={}",
            host, port, username, password, database, ssl_mode
        )
    }
}

fn column<'a, T>(row: &'a Row, name: &str) -> StoreResult<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Backend(format!("Failed to read column {}: {}", name, e)))
}

fn credential_from_row(row: &Row) -> StoreResult<CredentialRecord> {
    Ok(CredentialRecord {
        username: column(row, "username")?,
        password: column(row, "password")?,
        version: column(row, "version")?,
        last_rotated: column(row, "last_rotated")?,
    })
}

fn job_from_row(row: &Row) -> StoreResult<RotationJob> {
    let status: String = column(row, "status")?;
    let attempts: i32 = column(row, "attempts")?;

    let claim_token: Option<Uuid> = column(row, "claim_token")?;
    let lease_expires_at: Option<DateTime<Utc>> = column(row, "lease_expires_at")?;
    let claim = match (claim_token, lease_expires_at) {
        (Some(token), Some(lease_expires_at)) => Some(JobClaim {
            token,
            lease_expires_at,
        }),
        _ => None,
    };

    let follow_up_due_at: Option<DateTime<Utc>> = column(row, "follow_up_due_at")?;
    let follow_up_version: Option<i64> = column(row, "follow_up_version")?;
    let follow_up = match (follow_up_due_at, follow_up_version) {
        (Some(due_at), Some(based_on_version)) => Some(FollowUp {
            due_at,
            based_on_version,
        }),
        _ => None,
    };

    Ok(RotationJob {
        id: column(row, "id")?,
        target_username: column(row, "target_username")?,
        scheduled_at: column(row, "scheduled_at")?,
        due_at: column(row, "due_at")?,
        based_on_version: column(row, "based_on_version")?,
        status: status.parse().map_err(StoreError::Backend)?,
        attempts: attempts.max(0) as u32,
        claim,
        follow_up,
        finished_at: column(row, "finished_at")?,
        last_error: column(row, "last_error")?,
    })
}

#[async_trait::async_trait]
impl CredentialStore for PostgresStore {
    async fn create(
        &self,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CredentialRecord> {
        let query = format!(
            "INSERT INTO credentials (username, password, version, last_rotated) \
             VALUES ($1, $2, 1, $3) RETURNING {}",
            CREDENTIAL_COLUMNS
        );
        let row = self
            .pool
            .get()
            .await?
            .query_one(&query, &[&username, &password, &now])
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::AlreadyExists(_) => StoreError::AlreadyExists(username.to_string()),
                other => other,
            })?;
        credential_from_row(&row)
    }

    async fn get(&self, username: &str) -> StoreResult<CredentialRecord> {
        let query = format!(
            "SELECT {} FROM credentials WHERE username = $1",
            CREDENTIAL_COLUMNS
        );
        let row = self
            .pool
            .get()
            .await?
            .query_opt(&query, &[&username])
            .await?
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
        credential_from_row(&row)
    }

    async fn conditional_update(
        &self,
        username: &str,
        expected_version: i64,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CredentialRecord> {
        let query = format!(
            "UPDATE credentials SET password = $3, last_rotated = $4, version = version + 1 \
             WHERE username = $1 AND version = $2 RETURNING {}",
            CREDENTIAL_COLUMNS
        );
        let client = self.pool.get().await?;
        if let Some(row) = client
            .query_opt(&query, &[&username, &expected_version, &new_password, &now])
            .await?
        {
            return credential_from_row(&row);
        }

        // Nothing matched: tell a missing record apart from a moved version
        let current = client
            .query_opt(
                "SELECT version FROM credentials WHERE username = $1",
                &[&username],
            )
            .await?;
        match current {
            Some(row) => Err(StoreError::VersionConflict {
                username: username.to_string(),
                expected: expected_version,
                actual: column(&row, "version")?,
            }),
            None => Err(StoreError::NotFound(username.to_string())),
        }
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresStore {
    async fn enqueue(
        &self,
        username: &str,
        scheduled_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
        based_on_version: i64,
    ) -> StoreResult<ScheduleOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let active = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM rotation_jobs \
                     WHERE target_username = $1 AND status IN ('pending', 'running') \
                     FOR UPDATE",
                    JOB_COLUMNS
                ),
                &[&username],
            )
            .await?
            .map(|row| job_from_row(&row))
            .transpose()?;

        let outcome = match active {
            Some(job) if job.status == JobStatus::Pending => {
                let row = tx
                    .query_one(
                        &format!("{} RETURNING {}", COALESCE_PENDING, JOB_COLUMNS),
                        &[&job.id, &scheduled_at, &due_at, &based_on_version],
                    )
                    .await?;
                ScheduleOutcome::Coalesced(job_from_row(&row)?)
            }
            Some(job) => {
                let row = tx
                    .query_one(
                        &format!("{} RETURNING {}", RECORD_FOLLOW_UP, JOB_COLUMNS),
                        &[&job.id, &due_at, &based_on_version],
                    )
                    .await?;
                ScheduleOutcome::Deferred(job_from_row(&row)?)
            }
            None => {
                let job = RotationJob::pending(username, scheduled_at, due_at, based_on_version);
                insert_pending(&tx, &job).await.map_err(|e| match e {
                    // Another process inserted the active job between our read and write
                    StoreError::AlreadyExists(_) => StoreError::Transient(format!(
                        "concurrent rotation scheduling for {}",
                        username
                    )),
                    other => other,
                })?;
                ScheduleOutcome::Created(job)
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<RotationJob>> {
        let query = format!(
            "UPDATE rotation_jobs \
             SET status = 'running', attempts = attempts + 1, \
                 claim_token = $1, lease_expires_at = $2 \
             WHERE id = ( \
                 SELECT id FROM rotation_jobs \
                 WHERE (status = 'pending' AND due_at <= $3) \
                    OR (status = 'running' AND lease_expires_at <= $3) \
                 ORDER BY due_at \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) RETURNING {}",
            JOB_COLUMNS
        );
        let token = Uuid::new_v4();
        let lease_expires_at = lease_expiry(now, lease);

        self.pool
            .get()
            .await?
            .query_opt(&query, &[&token, &lease_expires_at, &now])
            .await?
            .map(|row| job_from_row(&row))
            .transpose()
    }

    async fn finish(
        &self,
        job_id: Uuid,
        claim_token: Uuid,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<FinishOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let current = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM rotation_jobs WHERE id = $1 FOR UPDATE",
                    JOB_COLUMNS
                ),
                &[&job_id],
            )
            .await?
            .ok_or(StoreError::JobNotFound(job_id))
            .and_then(|row| job_from_row(&row))?;

        let holds_claim = current.status == JobStatus::Running
            && current.claim.map(|claim| claim.token) == Some(claim_token);
        if !holds_claim {
            return Ok(FinishOutcome::LostClaim);
        }

        let reason = outcome.reason();
        let row = tx
            .query_one(
                &format!(
                    "UPDATE rotation_jobs \
                     SET status = $2, finished_at = $3, last_error = $4, \
                         claim_token = NULL, lease_expires_at = NULL, \
                         follow_up_due_at = NULL, follow_up_version = NULL \
                     WHERE id = $1 RETURNING {}",
                    JOB_COLUMNS
                ),
                &[&job_id, &outcome.status().as_str(), &now, &reason],
            )
            .await?;
        let finished = job_from_row(&row)?;

        let follow_up = match current.follow_up {
            Some(follow_up) => {
                let next = RotationJob::pending(
                    &finished.target_username,
                    now,
                    follow_up.due_at,
                    follow_up.based_on_version,
                );
                insert_pending(&tx, &next).await?;
                Some(next)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(FinishOutcome::Finished {
            job: finished,
            follow_up,
        })
    }

    async fn next_wakeup(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let row = self
            .pool
            .get()
            .await?
            .query_one(
                "SELECT MIN(CASE WHEN status = 'pending' THEN due_at ELSE lease_expires_at END) \
                 AS wakeup FROM rotation_jobs WHERE status IN ('pending', 'running')",
                &[],
            )
            .await?;
        column(&row, "wakeup")
    }

    async fn job(&self, id: Uuid) -> StoreResult<RotationJob> {
        let row = self
            .pool
            .get()
            .await?
            .query_opt(
                &format!("SELECT {} FROM rotation_jobs WHERE id = $1", JOB_COLUMNS),
                &[&id],
            )
            .await?
            .ok_or(StoreError::JobNotFound(id))?;
        job_from_row(&row)
    }

    async fn history(&self, username: &str) -> StoreResult<Vec<RotationJob>> {
        self.pool
            .get()
            .await?
            .query(
                &format!(
                    "SELECT {} FROM rotation_jobs WHERE target_username = $1 \
                     ORDER BY scheduled_at DESC",
                    JOB_COLUMNS
                ),
                &[&username],
            )
            .await?
            .iter()
            .map(job_from_row)
            .collect()
    }

    async fn active_jobs(&self) -> StoreResult<Vec<RotationJob>> {
        self.pool
            .get()
            .await?
            .query(
                &format!(
                    "SELECT {} FROM rotation_jobs WHERE status IN ('pending', 'running') \
                     ORDER BY due_at",
                    JOB_COLUMNS
                ),
                &[],
            )
            .await?
            .iter()
            .map(job_from_row)
            .collect()
    }
}

async fn insert_pending(tx: &tokio_postgres::Transaction<'_>, job: &RotationJob) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO rotation_jobs \
         (id, target_username, scheduled_at, due_at, based_on_version, status, attempts) \
         VALUES ($1, $2, $3, $4, $5, 'pending', 0)",
        &[
            &job.id,
            &job.target_username,
            &job.scheduled_at,
            &job.due_at,
            &job.based_on_version,
        ],
    )
    .await?;
    Ok(())
}
