use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};

use migration::Migration;
use sea_orm::{DatabaseConnection, SqlxPostgresConnector};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::db::{AdminConfig, ConnectConfig, MigrationConfig, TargetConfig};
use crate::config::run::{LockMode, RunOptions};
use crate::error::{DbInfraError, Tier};
use crate::infra::db::inspect;
use crate::infra::db::ledger::{self, AppliedMigration, LEDGER_TABLE};
use crate::infra::db::locking::{
    acquire_with_backoff, migrate_lock_key, provision_lock_key, BootstrapLock, Guard, NoopLock,
    PgAdvisoryLock,
};
use crate::infra::db::provision::{ensure_target, remove_target, ProvisionReport};
use crate::infra::db::runner::{FailedAt, MigrationRunner, RunReport};
use crate::infra::db::session::PgSession;

/// Result of a full `up` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Present for two-tier runs only
    pub provision: Option<ProvisionReport>,
    pub run: RunReport,
}

/// What `status` found on the target database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub tables: Vec<String>,
    /// `None` when the ledger table does not exist
    pub ledger: Option<Vec<AppliedMigration>>,
}

async fn retry_connection<T, F, Fut>(
    mut connect_fn: F,
    max_attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<T, DbInfraError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbInfraError>>,
{
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match connect_fn().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        "connection_retry=success attempts={} interval_ms={}",
                        attempt,
                        interval.as_millis()
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                last_error = Some(e);
                if attempt < max_attempts {
                    warn!(
                        "connection_retry=failed attempt={} max_attempts={} interval_ms={}",
                        attempt,
                        max_attempts,
                        interval.as_millis()
                    );
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            return Err(DbInfraError::Cancelled { phase: "connect" });
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }

    let final_error = last_error.unwrap_or_else(|| DbInfraError::Config {
        message: "no error recorded after max attempts (this should not happen)".to_string(),
    });
    Err(final_error)
}

fn check_tls_files(tier: Tier, config: &ConnectConfig) -> Result<(), DbInfraError> {
    let Some(tls) = config.tls_files() else {
        return Ok(());
    };
    for path in [&tls.ca_cert, &tls.client_cert, &tls.client_key] {
        if !path.is_file() {
            return Err(DbInfraError::Connection {
                tier,
                message: format!("certificate file {} not found", path.display()),
            });
        }
    }
    Ok(())
}

/// Open a single-session pool for `tier` with the statement timeout applied
/// to every physical connection.
///
/// INVARIANT: min=max=1 with no lifetime or idle recycling, so the advisory
/// lock, session settings and every transaction of the phase share one
/// physical session.
pub async fn connect(
    tier: Tier,
    config: &ConnectConfig,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<DatabaseConnection, DbInfraError> {
    check_tls_files(tier, config)?;

    let connect_options = PgConnectOptions::from_str(&config.url())
        .map_err(|e| DbInfraError::Connection {
            tier,
            message: format!("invalid connection url {}: {e}", config.redacted_url()),
        })?
        .disable_statement_logging();

    debug!(tier = %tier, url = %config.redacted_url(), "Connecting");

    let session_settings = vec![format!(
        "SET statement_timeout = {}",
        options.statement_timeout.as_millis()
    )];
    let pool = retry_connection(
        || {
            let connect_options = connect_options.clone();
            let session_settings = session_settings.clone();
            async move {
                PgPoolOptions::new()
                    .min_connections(1)
                    .max_connections(1)
                    .acquire_timeout(options.connect_timeout)
                    .max_lifetime(None)
                    .idle_timeout(None)
                    .test_before_acquire(false)
                    .after_connect(move |conn, _meta| {
                        let settings = session_settings.clone();
                        Box::pin(async move {
                            apply_session_settings(conn, &settings).await?;
                            Ok::<_, sqlx::Error>(())
                        })
                    })
                    .connect_with(connect_options)
                    .await
                    .map_err(|e| DbInfraError::Connection {
                        tier,
                        message: format!("failed to connect to {}: {e}", config.redacted_url()),
                    })
            }
        },
        options.connect_attempts,
        options.retry_interval,
        cancel,
    )
    .await?;

    Ok(SqlxPostgresConnector::from_sqlx_postgres_pool(pool))
}

async fn apply_session_settings(
    conn: &mut sqlx::PgConnection,
    statements: &[String],
) -> Result<(), sqlx::Error> {
    for stmt in statements {
        sqlx::query(stmt).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn close(conn: DatabaseConnection, tier: Tier) {
    if let Err(e) = conn.close().await {
        warn!(tier = %tier, error = %e, "Failed to close connection");
    }
}

async fn acquire_lock(
    conn: &DatabaseConnection,
    options: &RunOptions,
    key: &str,
    cancel: &CancellationToken,
) -> Result<Guard, DbInfraError> {
    let mut lock: Box<dyn BootstrapLock> = match options.lock {
        LockMode::Advisory => Box::new(PgAdvisoryLock::new(conn.clone(), key)),
        LockMode::None => Box::new(NoopLock),
    };

    let start = Instant::now();
    let guard = acquire_with_backoff(lock.as_mut(), options.lock_timeout, cancel).await?;
    debug!(
        lock = "acquired",
        key,
        lock_id = guard.lock_key(),
        elapsed_ms = start.elapsed().as_millis()
    );
    Ok(guard)
}

/// Run `work` on `conn` under the lock for `key`, releasing it whatever the
/// outcome. The work's error wins over a release error.
async fn with_lock<T, F, Fut>(
    conn: &DatabaseConnection,
    options: &RunOptions,
    key: &str,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, DbInfraError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, DbInfraError>>,
{
    let guard = acquire_lock(conn, options, key, cancel).await?;
    let result = work().await;
    let released = guard.release().await;
    let value = result?;
    released?;
    Ok(value)
}

/// Ensure the target role and database exist, using the admin tier.
pub async fn provision(
    admin: &AdminConfig,
    target: &TargetConfig,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<ProvisionReport, DbInfraError> {
    let start = Instant::now();
    info!(
        "provision=start admin={} database={} role={}",
        admin.connect_config().redacted_url(),
        target.database(),
        target.username()
    );

    let conn = connect(Tier::Admin, admin.connect_config(), options, cancel).await?;
    let key = provision_lock_key(target.database());
    let result = with_lock(&conn, options, &key, cancel, || ensure_target(&conn, target)).await;
    close(conn, Tier::Admin).await;

    let report = result?;
    info!(
        provision = "done",
        role_created = report.role_created,
        database_created = report.database_created,
        elapsed_ms = start.elapsed().as_millis()
    );
    Ok(report)
}

/// Apply `migrations` in order on the target database.
pub async fn migrate_target(
    target: &TargetConfig,
    migrations: &[Migration],
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<RunReport, DbInfraError> {
    let start = Instant::now();
    let mut runner = MigrationRunner::new(migrations, options.ledger);
    runner.connecting();

    info!(
        "migrate=start target={} migrations={} ledger={:?} lock={:?}",
        target.connect_config().redacted_url(),
        migrations.len(),
        options.ledger,
        options.lock
    );

    let conn = match connect(Tier::Target, target.connect_config(), options, cancel).await {
        Ok(conn) => conn,
        Err(e) => {
            runner.fail_before_apply(FailedAt::Connect);
            return Err(e);
        }
    };

    let guard = match acquire_lock(&conn, options, &migrate_lock_key(target.database()), cancel).await
    {
        Ok(guard) => guard,
        Err(e) => {
            runner.fail_before_apply(FailedAt::Lock);
            close(conn, Tier::Target).await;
            return Err(e);
        }
    };

    let mut session = PgSession::new(conn.clone());
    let result = runner.apply(&mut session, cancel).await;
    drop(session);

    let released = guard.release().await;
    close(conn, Tier::Target).await;

    match &result {
        Ok(report) => info!(
            "migrate=done state={} applied={} skipped={} elapsed_ms={}",
            report.state,
            report.applied.len(),
            report.skipped.len(),
            start.elapsed().as_millis()
        ),
        Err(_) => info!(
            "migrate=stopped state={} elapsed_ms={}",
            runner.state(),
            start.elapsed().as_millis()
        ),
    }

    let report = result?;
    released?;
    Ok(report)
}

/// Provision (two-tier only), then migrate.
pub async fn orchestrate_migration(
    config: &MigrationConfig,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<Outcome, DbInfraError> {
    match config {
        MigrationConfig::SingleTier(single) => {
            let target = single.target()?;
            let run = migrate_target(&target, &single.migrations, options, cancel).await?;
            Ok(Outcome {
                provision: None,
                run,
            })
        }
        MigrationConfig::TwoTier(two) => {
            let report = provision(&two.admin, &two.target, options, cancel).await?;
            if cancel.is_cancelled() {
                return Err(DbInfraError::Cancelled {
                    phase: "provisioning",
                });
            }
            let run = migrate_target(&two.target, &two.migrations, options, cancel).await?;
            Ok(Outcome {
                provision: Some(report),
                run,
            })
        }
    }
}

/// Drop the target database and role through the admin tier.
pub async fn clean(
    admin: &AdminConfig,
    target: &TargetConfig,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<(), DbInfraError> {
    info!(
        "clean=start database={} role={}",
        target.database(),
        target.username()
    );

    let conn = connect(Tier::Admin, admin.connect_config(), options, cancel).await?;
    let key = provision_lock_key(target.database());
    let result = with_lock(&conn, options, &key, cancel, || remove_target(&conn, target)).await;
    close(conn, Tier::Admin).await;
    result
}

/// Read the target's tables and, when present, its ledger.
pub async fn status(
    target: &TargetConfig,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<Status, DbInfraError> {
    let conn = connect(Tier::Target, target.connect_config(), options, cancel).await?;
    let result = read_status(&conn).await;
    close(conn, Tier::Target).await;
    result
}

async fn read_status(conn: &DatabaseConnection) -> Result<Status, DbInfraError> {
    let query_err = |e: sea_orm::DbErr| DbInfraError::Query {
        message: e.to_string(),
    };

    let tables = inspect::list_tables(conn).await.map_err(query_err)?;
    let ledger = if inspect::table_exists(conn, LEDGER_TABLE)
        .await
        .map_err(query_err)?
    {
        Some(ledger::load(conn).await.map_err(query_err)?)
    } else {
        None
    };

    Ok(Status { tables, ledger })
}
