//! Applies an ordered migration list over one session.
//!
//! Each migration gets its own transaction with a savepoint around the SQL
//! body. Migrations before a failure stay committed; the failing one leaves
//! nothing behind.

use std::fmt;
use std::time::Instant;

use migration::Migration;
use sea_orm::DbErr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::db_errors::is_concurrent_duplicate;
use super::ledger::LedgerEntry;
use super::session::MigrationSession;
use crate::config::run::LedgerMode;
use crate::error::DbInfraError;

/// Where a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedAt {
    /// The target session could not be opened or prepared
    Connect,
    /// The run lock could not be taken
    Lock,
    /// Migration at this index failed or the run was cancelled before it committed
    Migration(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    Applying(usize),
    Done,
    Failed(FailedAt),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed(_))
    }

    pub fn can_transition_to(&self, next: &RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Applying(0) | Done) => true,
            (Connecting, Failed(FailedAt::Connect | FailedAt::Lock)) => true,
            // Cancellation or ledger trouble before the first migration starts
            (Connecting, Failed(FailedAt::Migration(0))) => true,
            (Applying(i), Applying(j)) => j > i,
            (Applying(_), Done) => true,
            (Applying(i), Failed(FailedAt::Migration(j))) => j >= i,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("idle"),
            RunState::Connecting => f.write_str("connecting"),
            RunState::Applying(i) => write!(f, "applying({i})"),
            RunState::Done => f.write_str("done"),
            RunState::Failed(FailedAt::Connect) => f.write_str("failed(connect)"),
            RunState::Failed(FailedAt::Lock) => f.write_str("failed(lock)"),
            RunState::Failed(FailedAt::Migration(i)) => write!(f, "failed({i})"),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Indices executed and committed by this run
    pub applied: Vec<usize>,
    /// Indices skipped because the ledger already had them
    pub skipped: Vec<usize>,
    pub state: RunState,
}

enum StepError {
    Db(DbErr),
    Cancelled,
}

impl From<DbErr> for StepError {
    fn from(err: DbErr) -> Self {
        StepError::Db(err)
    }
}

pub struct MigrationRunner<'a> {
    migrations: &'a [Migration],
    ledger: LedgerMode,
    state: RunState,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(migrations: &'a [Migration], ledger: LedgerMode) -> Self {
        Self {
            migrations,
            ledger,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        if !self.state.can_transition_to(&next) {
            warn!(from = %self.state, to = %next, "Unexpected runner state transition");
        }
        debug!(runner = "state", from = %self.state, to = %next);
        self.state = next;
    }

    pub fn connecting(&mut self) {
        self.transition(RunState::Connecting);
    }

    /// Mark the run failed before any migration started.
    pub fn fail_before_apply(&mut self, at: FailedAt) {
        self.transition(RunState::Failed(at));
    }

    /// Apply every migration in order on `session`.
    ///
    /// Stops at the first failure, which leaves earlier migrations committed.
    /// A runner that already finished refuses to run again.
    pub async fn apply<S>(
        &mut self,
        session: &mut S,
        cancel: &CancellationToken,
    ) -> Result<RunReport, DbInfraError>
    where
        S: MigrationSession + ?Sized,
    {
        if self.state.is_terminal() {
            return Err(DbInfraError::config(format!(
                "migration runner already finished ({})",
                self.state
            )));
        }
        if self.state == RunState::Idle {
            self.connecting();
        }

        let migrations = self.migrations;
        let mut applied = Vec::new();
        let mut skipped = Vec::new();

        if self.ledger == LedgerMode::Enabled {
            if let Err(e) = session.ensure_ledger().await {
                self.transition(RunState::Failed(FailedAt::Migration(0)));
                return Err(DbInfraError::Ledger {
                    message: format!("failed to create ledger table: {e}"),
                });
            }
        }

        for (index, migration) in migrations.iter().enumerate() {
            if cancel.is_cancelled() {
                self.transition(RunState::Failed(FailedAt::Migration(index)));
                return Err(DbInfraError::Cancelled { phase: "migration" });
            }
            self.transition(RunState::Applying(index));
            let start = Instant::now();

            if let Err(e) = session.begin().await {
                self.transition(RunState::Failed(FailedAt::Migration(index)));
                return Err(migration_error(index, migration, e));
            }

            let entry = match self.ledger {
                LedgerMode::Disabled => None,
                LedgerMode::Enabled => match self.check_ledger(session, index, migration).await {
                    Ok(LedgerCheck::Pending(entry)) => Some(entry),
                    Ok(LedgerCheck::Recorded) => {
                        if let Err(e) = session.rollback().await {
                            self.transition(RunState::Failed(FailedAt::Migration(index)));
                            return Err(migration_error(index, migration, e));
                        }
                        debug!(migrate = "skip", index, name = migration.name());
                        skipped.push(index);
                        continue;
                    }
                    Err(err) => {
                        rollback_quietly(session, index).await;
                        self.transition(RunState::Failed(FailedAt::Migration(index)));
                        return Err(err);
                    }
                },
            };

            let savepoint = savepoint_name(index);
            match apply_one(session, &savepoint, migration, entry.as_ref(), cancel).await {
                Ok(()) => {
                    info!(
                        migrate = "applied",
                        index,
                        name = migration.name(),
                        elapsed_ms = start.elapsed().as_millis()
                    );
                    applied.push(index);
                }
                Err(step) => {
                    undo(session, &savepoint, index).await;
                    self.transition(RunState::Failed(FailedAt::Migration(index)));
                    return Err(match step {
                        StepError::Db(e) => migration_error(index, migration, e),
                        StepError::Cancelled => DbInfraError::Cancelled { phase: "migration" },
                    });
                }
            }
        }

        self.transition(RunState::Done);
        Ok(RunReport {
            applied,
            skipped,
            state: self.state,
        })
    }

    async fn check_ledger<S>(
        &self,
        session: &mut S,
        index: usize,
        migration: &Migration,
    ) -> Result<LedgerCheck, DbInfraError>
    where
        S: MigrationSession + ?Sized,
    {
        let id = i32::try_from(index).map_err(|_| DbInfraError::Ledger {
            message: format!("migration index {index} does not fit the ledger id column"),
        })?;
        let entry = LedgerEntry::for_migration(id, migration);

        let recorded = session
            .recorded_checksum(id)
            .await
            .map_err(|e| DbInfraError::Ledger {
                message: format!("failed to read ledger entry {id}: {e}"),
            })?;

        match recorded {
            None => Ok(LedgerCheck::Pending(entry)),
            Some(recorded) if recorded == entry.checksum => Ok(LedgerCheck::Recorded),
            Some(recorded) => Err(DbInfraError::ChecksumMismatch {
                index,
                recorded,
                current: entry.checksum,
            }),
        }
    }
}

enum LedgerCheck {
    Pending(LedgerEntry),
    Recorded,
}

pub fn savepoint_name(index: usize) -> String {
    format!("migration_{index}")
}

fn migration_error(index: usize, migration: &Migration, source: DbErr) -> DbInfraError {
    DbInfraError::Migration {
        index,
        name: migration.name().to_string(),
        source,
    }
}

async fn apply_one<S>(
    session: &mut S,
    savepoint: &str,
    migration: &Migration,
    entry: Option<&LedgerEntry>,
    cancel: &CancellationToken,
) -> Result<(), StepError>
where
    S: MigrationSession + ?Sized,
{
    session.execute(&format!("SAVEPOINT {savepoint}")).await?;

    if let Err(e) = run_body(session, migration, cancel).await? {
        if !is_concurrent_duplicate(&e) {
            return Err(e.into());
        }
        // A concurrent run committed the same objects; the guarded body now
        // sees them.
        debug!(savepoint, error = %e, "Lost catalog race, re-running migration body");
        session
            .execute(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
            .await?;
        run_body(session, migration, cancel).await??;
    }

    if let Some(entry) = entry {
        session.record(entry).await?;
    }
    session
        .execute(&format!("RELEASE SAVEPOINT {savepoint}"))
        .await?;
    session.commit().await?;
    Ok(())
}

async fn run_body<S>(
    session: &mut S,
    migration: &Migration,
    cancel: &CancellationToken,
) -> Result<Result<(), DbErr>, StepError>
where
    S: MigrationSession + ?Sized,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(StepError::Cancelled),
        result = session.execute(migration.sql()) => Ok(result),
    }
}

/// Throw away the failed migration's work. Errors are logged; the
/// transaction is gone either way once the session closes.
async fn undo<S>(session: &mut S, savepoint: &str, index: usize)
where
    S: MigrationSession + ?Sized,
{
    if let Err(e) = session
        .execute(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
        .await
    {
        warn!(index, error = %e, "Rollback to savepoint failed");
    }
    rollback_quietly(session, index).await;
}

async fn rollback_quietly<S>(session: &mut S, index: usize)
where
    S: MigrationSession + ?Sized,
{
    if let Err(e) = session.rollback().await {
        warn!(index, error = %e, "Transaction rollback failed");
    }
}
