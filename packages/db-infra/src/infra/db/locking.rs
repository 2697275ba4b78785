// Standard library imports
use std::time::{Duration, Instant};

// External crate imports
use async_trait::async_trait;
use rand::Rng;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

// Internal crate imports
use crate::error::DbInfraError;

pub fn pg_lock_id(key: &str) -> i64 {
    xxh3_64(key.as_bytes()) as i64
}

/// Key serialising migration runs against one target database.
pub fn migrate_lock_key(database: &str) -> String {
    format!("migrate:{database}")
}

/// Key serialising provisioning of one target database from the admin tier.
pub fn provision_lock_key(database: &str) -> String {
    format!("provision:{database}")
}

// ============================================================================
// BootstrapLock Trait and Implementations
// ============================================================================

/// Guard struct that represents a held lock.
/// Only holds (connection handle, lock key, released flag) - no long-lived checkout.
pub struct Guard {
    conn: Option<DatabaseConnection>,
    lock_key: i64,
    released: bool,
}

impl Guard {
    fn postgres(conn: DatabaseConnection, lock_key: i64) -> Self {
        Self {
            conn: Some(conn),
            lock_key,
            released: false,
        }
    }

    pub(crate) fn noop() -> Self {
        Self {
            conn: None,
            lock_key: 0, // Sentinel value for the no-op lock
            released: false,
        }
    }

    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    /// Release the lock on the session that took it.
    /// Unlock failures are logged, not returned: the session is closed right after.
    pub async fn release(mut self) -> Result<(), DbInfraError> {
        if self.released {
            return Ok(());
        }

        let Some(conn) = self.conn.take() else {
            self.released = true;
            return Ok(());
        };

        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_advisory_unlock($1) AS unlocked",
            vec![self.lock_key.into()],
        );

        match conn.query_one(stmt).await {
            Ok(Some(row)) => {
                let unlocked: bool = row.try_get("", "unlocked").map_err(|e| DbInfraError::Lock {
                    message: format!("failed to read unlock result: {e}"),
                })?;

                if !unlocked {
                    warn!(
                        code = "PG_UNLOCK_FALSE",
                        lock_key = self.lock_key,
                        "Advisory lock unlock returned false"
                    );
                } else {
                    debug!(lock_key = self.lock_key, "Advisory lock released");
                }
            }
            Ok(None) => {
                warn!(
                    lock_key = self.lock_key,
                    "No result from advisory lock unlock query"
                );
            }
            Err(e) => {
                warn!(
                    error = %e,
                    lock_key = self.lock_key,
                    "Failed to unlock advisory lock"
                );
            }
        }

        self.released = true;
        Ok(())
    }
}

/// Trait for migration/provisioning lock acquisition.
#[async_trait]
pub trait BootstrapLock: Send {
    /// Try to acquire the lock (non-blocking).
    /// Returns Some(Guard) if acquired, None if already held by another process.
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError>;
}

/// PostgreSQL session advisory lock.
pub struct PgAdvisoryLock {
    conn: DatabaseConnection,
    lock_key: i64,
}

impl PgAdvisoryLock {
    /// INVARIANT: `conn` is a pool with **min=max=1**, so every checkout reuses
    /// the same physical session that holds the advisory lock. The migration
    /// transactions run on that same session.
    pub fn new(conn: DatabaseConnection, key: &str) -> Self {
        Self {
            conn,
            lock_key: pg_lock_id(key),
        }
    }
}

#[async_trait]
impl BootstrapLock for PgAdvisoryLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        let lock_stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_try_advisory_lock($1) AS locked",
            vec![self.lock_key.into()],
        );

        let result = self
            .conn
            .query_one(lock_stmt)
            .await
            .map_err(|e| DbInfraError::Lock {
                message: format!("failed to acquire advisory lock: {e}"),
            })?;

        let locked: bool = match result {
            Some(row) => row.try_get("", "locked").map_err(|e| DbInfraError::Lock {
                message: format!("failed to read lock result: {e}"),
            })?,
            None => {
                return Err(DbInfraError::Lock {
                    message: "pg_try_advisory_lock returned no row".to_string(),
                })
            }
        };

        if !locked {
            return Ok(None);
        }

        Ok(Some(Guard::postgres(self.conn.clone(), self.lock_key)))
    }
}

/// Lock used when locking is switched off.
pub struct NoopLock;

#[async_trait]
impl BootstrapLock for NoopLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        Ok(Some(Guard::noop()))
    }
}

/// Poll `lock` with exponential backoff and jitter until it is acquired,
/// `timeout` elapses or `cancel` fires.
pub async fn acquire_with_backoff<L>(
    lock: &mut L,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Guard, DbInfraError>
where
    L: BootstrapLock + ?Sized,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        if let Some(guard) = lock.try_acquire().await? {
            trace!(
                lock = "won",
                attempts = attempts,
                elapsed_ms = start.elapsed().as_millis()
            );
            return Ok(guard);
        }

        let base_delay_ms = (5u64 << attempts.saturating_sub(1).min(16)).min(80);
        let jitter_ms = rand::rng().random::<u64>() % 4;
        let delay_ms = base_delay_ms + jitter_ms;

        trace!(
            lock = "backoff",
            attempts = attempts,
            delay_ms = delay_ms,
            elapsed_ms = start.elapsed().as_millis()
        );

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(
                    elapsed_ms = start.elapsed().as_millis(),
                    attempts = attempts,
                    "Lock acquisition cancelled during backoff"
                );
                return Err(DbInfraError::Cancelled { phase: "lock acquisition" });
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                if start.elapsed() >= timeout {
                    return Err(DbInfraError::Timeout {
                        phase: "lock acquisition",
                        elapsed_ms: start.elapsed().as_millis(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reports contention a fixed number of times, then grants the lock.
    struct ContendedLock {
        remaining: u32,
        attempts: u32,
    }

    #[async_trait]
    impl BootstrapLock for ContendedLock {
        async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
            self.attempts += 1;
            if self.remaining == 0 {
                return Ok(Some(Guard::noop()));
            }
            self.remaining -= 1;
            Ok(None)
        }
    }

    #[test]
    fn test_lock_id_is_stable_per_key() {
        assert_eq!(pg_lock_id("migrate:games"), pg_lock_id("migrate:games"));
        assert_ne!(
            pg_lock_id(&migrate_lock_key("games")),
            pg_lock_id(&provision_lock_key("games"))
        );
        assert_ne!(
            pg_lock_id(&migrate_lock_key("games")),
            pg_lock_id(&migrate_lock_key("users"))
        );
    }

    #[tokio::test]
    async fn test_acquires_after_contention() {
        let mut lock = ContendedLock {
            remaining: 3,
            attempts: 0,
        };
        let guard = acquire_with_backoff(&mut lock, Duration::from_secs(5), &CancellationToken::new())
            .await
            .expect("lock should be acquired");
        assert_eq!(lock.attempts, 4);
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_times_out_when_never_released() {
        let mut lock = ContendedLock {
            remaining: u32::MAX,
            attempts: 0,
        };
        let err = acquire_with_backoff(&mut lock, Duration::from_millis(50), &CancellationToken::new())
            .await
            .err()
            .expect("acquisition should time out");
        assert!(matches!(err, DbInfraError::Timeout { phase: "lock acquisition", .. }));
        assert!(lock.attempts > 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_backoff() {
        let mut lock = ContendedLock {
            remaining: u32::MAX,
            attempts: 0,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = acquire_with_backoff(&mut lock, Duration::from_secs(30), &cancel)
            .await
            .err()
            .expect("acquisition should be cancelled");
        assert!(matches!(err, DbInfraError::Cancelled { .. }));
        assert_eq!(lock.attempts, 1);
    }

    #[tokio::test]
    async fn test_noop_lock_always_granted() {
        let guard = acquire_with_backoff(&mut NoopLock, Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(guard.lock_key(), 0);
        guard.release().await.unwrap();
    }
}
