use chrono::Utc;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::backends::{CredentialStore, JobOutcome, RotationJob};
use crate::config::RotationConfig;
use crate::error::StoreError;

/// Letters, digits and a fixed symbol set
pub const DEFAULT_CHARSET: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*";

/// Uniformly samples fixed-length passwords from a character set
#[derive(Debug, Clone)]
pub struct PasswordGenerator {
    charset: Vec<char>,
    length: usize,
}

impl PasswordGenerator {
    pub fn new(charset: &str, length: usize) -> Self {
        Self {
            charset: charset.chars().collect(),
            length,
        }
    }

    pub fn from_config(config: &RotationConfig) -> Self {
        Self::new(&config.charset, config.password_length)
    }

    pub fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| {
                let idx = rng.gen_range(0..self.charset.len());
                self.charset[idx]
            })
            .collect()
    }
}

impl Default for PasswordGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARSET, 12)
    }
}

/// Bounded exponential backoff for transient store failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RotationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        "{} failed: {}. Retrying in {:?}",
                        what,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RotationConfig::default())
    }
}

/// Rotate the job's credential if it still holds the version the job was based on.
///
/// A version conflict means someone else changed the password after the job was
/// scheduled, so the job is cancelled rather than overwriting a newer value.
pub async fn execute_rotation(
    credentials: &dyn CredentialStore,
    job: &RotationJob,
    generator: &PasswordGenerator,
    retry: &RetryPolicy,
) -> JobOutcome {
    let username = job.target_username.as_str();
    info!(
        "Rotating credential {} ({}) based on version {}",
        username,
        credentials.backend_type(),
        job.based_on_version
    );

    let new_password = generator.generate();
    let result = retry
        .run("Credential rotation", || {
            credentials.conditional_update(username, job.based_on_version, &new_password, Utc::now())
        })
        .await;

    match result {
        Ok(record) => {
            info!(
                "Password for '{}' rotated at {} (version {})",
                username,
                record.last_rotated.format("%Y-%m-%d %H:%M:%S UTC"),
                record.version
            );
            JobOutcome::Completed
        }
        Err(StoreError::VersionConflict {
            expected, actual, ..
        }) if actual == expected + 1
            && applied_by_earlier_attempt(credentials, username, &new_password).await =>
        {
            info!(
                "Rotation of '{}' to version {} was committed by an earlier attempt",
                username, actual
            );
            JobOutcome::Completed
        }
        Err(StoreError::VersionConflict {
            expected, actual, ..
        }) => {
            info!(
                "Skipping rotation of '{}': version moved from {} to {}",
                username, expected, actual
            );
            JobOutcome::Cancelled(format!(
                "superseded: expected version {}, found {}",
                expected, actual
            ))
        }
        Err(StoreError::NotFound(_)) => {
            warn!("Credential '{}' disappeared before rotation", username);
            JobOutcome::Cancelled("credential not found".to_string())
        }
        Err(e) => JobOutcome::Failed(e.to_string()),
    }
}

/// Whether the stored password is the one this job generated. A write can
/// commit even though its caller only saw a transient error.
async fn applied_by_earlier_attempt(
    credentials: &dyn CredentialStore,
    username: &str,
    new_password: &str,
) -> bool {
    matches!(
        credentials.get(username).await,
        Ok(record) if record.password == new_password
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{CredentialRecord, MemoryStore};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn test_generated_passwords_differ() {
        let generator = PasswordGenerator::new(DEFAULT_CHARSET, 32);
        let secret = generator.generate();
        assert_eq!(secret.chars().count(), 32);

        let secret2 = generator.generate();
        assert_ne!(secret, secret2); // Should be different each time
    }

    #[test]
    fn test_default_generator_uses_charset() {
        let generator = PasswordGenerator::default();
        let password = generator.generate();
        assert_eq!(password.chars().count(), 12);
        assert!(password.chars().all(|c| DEFAULT_CHARSET.contains(c)));
    }

    #[test]
    fn test_custom_charset() {
        let generator = PasswordGenerator::new("ab", 64);
        let password = generator.generate();
        assert_eq!(password.len(), 64);
        assert!(password.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = &AtomicU32::new(0);
        let result = quick_policy(3)
            .run("flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::Transient("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = quick_policy(3)
            .run("down", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Transient("down".into()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_permanent_errors() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = quick_policy(5)
            .run("conflict", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::NotFound("alice".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_rotation_completes_on_matching_version() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.create("alice", "Init@123", now).await.unwrap();
        let job = RotationJob::pending("alice", now, now, 1);

        let outcome =
            execute_rotation(&store, &job, &PasswordGenerator::default(), &quick_policy(1)).await;
        assert_eq!(outcome, JobOutcome::Completed);

        let record = store.get("alice").await.unwrap();
        assert_eq!(record.version, 2);
        assert_ne!(record.password, "Init@123");
    }

    #[tokio::test]
    async fn test_execute_rotation_cancels_stale_job() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.create("alice", "Init@123", now).await.unwrap();
        store
            .conditional_update("alice", 1, "Manual@456", now)
            .await
            .unwrap();
        let job = RotationJob::pending("alice", now, now, 1);

        let outcome =
            execute_rotation(&store, &job, &PasswordGenerator::default(), &quick_policy(1)).await;
        assert!(matches!(outcome, JobOutcome::Cancelled(_)));
        assert_eq!(store.get("alice").await.unwrap().password, "Manual@456");
    }

    /// Commits the first conditional update but reports it as a dropped connection
    struct LostAckStore {
        inner: MemoryStore,
        acked_once: AtomicBool,
    }

    #[async_trait::async_trait]
    impl CredentialStore for LostAckStore {
        async fn create(
            &self,
            username: &str,
            password: &str,
            now: DateTime<Utc>,
        ) -> Result<CredentialRecord, StoreError> {
            self.inner.create(username, password, now).await
        }

        async fn get(&self, username: &str) -> Result<CredentialRecord, StoreError> {
            self.inner.get(username).await
        }

        async fn conditional_update(
            &self,
            username: &str,
            expected_version: i64,
            new_password: &str,
            now: DateTime<Utc>,
        ) -> Result<CredentialRecord, StoreError> {
            let record = self
                .inner
                .conditional_update(username, expected_version, new_password, now)
                .await?;
            if self.acked_once.swap(true, Ordering::SeqCst) {
                Ok(record)
            } else {
                Err(StoreError::Transient("connection reset after commit".into()))
            }
        }

        fn backend_type(&self) -> &'static str {
            "lost-ack"
        }
    }

    #[tokio::test]
    async fn test_retry_that_finds_its_own_write_completes() {
        let store = LostAckStore {
            inner: MemoryStore::new(),
            acked_once: AtomicBool::new(false),
        };
        let now = Utc::now();
        store.create("alice", "Init@123", now).await.unwrap();
        let job = RotationJob::pending("alice", now, now, 1);

        let outcome =
            execute_rotation(&store, &job, &PasswordGenerator::default(), &quick_policy(3)).await;
        assert_eq!(outcome, JobOutcome::Completed);

        let record = store.get("alice").await.unwrap();
        assert_eq!(record.version, 2);
        assert_ne!(record.password, "Init@123");
    }

    #[tokio::test]
    async fn test_retry_that_finds_a_foreign_write_cancels() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.create("alice", "Init@123", now).await.unwrap();
        store
            .conditional_update("alice", 1, "Manual@456", now)
            .await
            .unwrap();
        let job = RotationJob::pending("alice", now, now, 1);

        // Version is exactly one ahead, but the password is not ours
        let outcome =
            execute_rotation(&store, &job, &PasswordGenerator::default(), &quick_policy(3)).await;
        assert!(matches!(outcome, JobOutcome::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_execute_rotation_cancels_missing_credential() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = RotationJob::pending("ghost", now, now, 1);

        let outcome =
            execute_rotation(&store, &job, &PasswordGenerator::default(), &quick_policy(1)).await;
        assert_eq!(
            outcome,
            JobOutcome::Cancelled("credential not found".to_string())
        );
    }
}
