//! Admin-tier provisioning of the target role and database.
//!
//! Every step checks the catalog first. When a concurrent creator wins the
//! race anyway, the loser sees either "already exists" or a unique violation
//! on the catalog index; both count as success once the object is visible,
//! so running it twice or in parallel is harmless.
//! Statements run in autocommit mode: `CREATE DATABASE` refuses to run inside
//! a transaction.

use std::future::Future;

use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, Statement};
use tracing::{debug, info, warn};

use super::db_errors::{is_already_exists, is_concurrent_duplicate, is_concurrent_update};
use crate::config::db::TargetConfig;
use crate::error::DbInfraError;

/// What a provisioning pass had to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProvisionReport {
    pub role_created: bool,
    pub database_created: bool,
}

/// Quote a Postgres identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn create_role_sql(username: &str, password: &str) -> String {
    format!(
        "CREATE ROLE {} WITH LOGIN PASSWORD {}",
        quote_ident(username),
        quote_literal(password)
    )
}

pub fn create_database_sql(database: &str, owner: &str) -> String {
    format!(
        "CREATE DATABASE {} OWNER {}",
        quote_ident(database),
        quote_ident(owner)
    )
}

pub fn grant_sql(database: &str, username: &str) -> String {
    format!(
        "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
        quote_ident(database),
        quote_ident(username)
    )
}

pub fn drop_database_sql(database: &str) -> String {
    format!("DROP DATABASE IF EXISTS {}", quote_ident(database))
}

pub fn drop_role_sql(username: &str) -> String {
    format!("DROP ROLE IF EXISTS {}", quote_ident(username))
}

async fn exists<C>(conn: &C, sql: &str, name: &str) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let stmt = Statement::from_sql_and_values(DatabaseBackend::Postgres, sql, vec![name.into()]);
    Ok(conn.query_one(stmt).await?.is_some())
}

pub async fn role_exists<C: ConnectionTrait>(conn: &C, username: &str) -> Result<bool, DbErr> {
    exists(conn, "SELECT 1 FROM pg_roles WHERE rolname = $1", username).await
}

pub async fn database_exists<C: ConnectionTrait>(conn: &C, database: &str) -> Result<bool, DbErr> {
    exists(conn, "SELECT 1 FROM pg_database WHERE datname = $1", database).await
}

/// Run `sql`, reporting whether it created something. Losing a race to a
/// concurrent creator counts as success without creation, provided
/// `exists_now` confirms the object is there.
async fn create<C, F, Fut>(
    conn: &C,
    step: &'static str,
    sql: &str,
    exists_now: F,
) -> Result<bool, DbInfraError>
where
    C: ConnectionTrait,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<bool, DbErr>>,
{
    let err = match conn.execute_unprepared(sql).await {
        Ok(_) => return Ok(true),
        Err(e) => e,
    };
    if is_already_exists(&err) {
        debug!(step, "Created concurrently by another process");
        return Ok(false);
    }
    if is_concurrent_duplicate(&err) && exists_now().await.unwrap_or(false) {
        debug!(step, error = %err, "Lost catalog race to another process");
        return Ok(false);
    }
    Err(DbInfraError::provisioning(step, err))
}

const GRANT_ATTEMPTS: u32 = 3;

async fn grant<C>(conn: &C, database: &str, username: &str) -> Result<(), DbInfraError>
where
    C: ConnectionTrait,
{
    let sql = grant_sql(database, username);
    let mut attempt = 1;
    loop {
        match conn.execute_unprepared(&sql).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt < GRANT_ATTEMPTS && is_concurrent_update(&e) => {
                warn!(attempt, error = %e, "Concurrent grant, retrying");
                attempt += 1;
            }
            Err(e) => return Err(DbInfraError::provisioning("grant privileges", e)),
        }
    }
}

/// Ensure the target role and database exist and the role owns the database.
pub async fn ensure_target<C>(conn: &C, target: &TargetConfig) -> Result<ProvisionReport, DbInfraError>
where
    C: ConnectionTrait,
{
    let username = target.username();
    let database = target.database();
    let mut report = ProvisionReport::default();

    if role_exists(conn, username)
        .await
        .map_err(|e| DbInfraError::provisioning("role lookup", e))?
    {
        info!(provision = "role_exists", role = username);
    } else {
        let password = &target.connect_config().password;
        report.role_created =
            create(conn, "create role", &create_role_sql(username, password), || {
                role_exists(conn, username)
            })
            .await?;
        info!(provision = "role", role = username, created = report.role_created);
    }

    if database_exists(conn, database)
        .await
        .map_err(|e| DbInfraError::provisioning("database lookup", e))?
    {
        info!(provision = "database_exists", database);
    } else {
        report.database_created = create(
            conn,
            "create database",
            &create_database_sql(database, username),
            || database_exists(conn, database),
        )
        .await?;
        info!(
            provision = "database",
            database,
            owner = username,
            created = report.database_created
        );
    }

    grant(conn, database, username).await?;

    Ok(report)
}

/// Drop the target database and role if present. Open sessions on the
/// database are terminated first.
pub async fn remove_target<C>(conn: &C, target: &TargetConfig) -> Result<(), DbInfraError>
where
    C: ConnectionTrait,
{
    let database = target.database();

    conn.execute(Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = $1 AND pid <> pg_backend_pid()",
        vec![database.into()],
    ))
    .await
    .map_err(|e| DbInfraError::provisioning("terminate sessions", e))?;

    conn.execute_unprepared(&drop_database_sql(database))
        .await
        .map_err(|e| DbInfraError::provisioning("drop database", e))?;
    conn.execute_unprepared(&drop_role_sql(target.username()))
        .await
        .map_err(|e| DbInfraError::provisioning("drop role", e))?;

    info!(clean = "done", database, role = target.username());
    Ok(())
}
