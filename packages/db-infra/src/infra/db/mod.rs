pub mod core;
pub mod db_errors;
pub mod inspect;
pub mod ledger;
pub mod locking;
pub mod provision;
pub mod runner;
pub mod session;

pub use self::core::{
    clean, connect, migrate_target, orchestrate_migration, provision, status, Outcome, Status,
};
pub use locking::{BootstrapLock, Guard, NoopLock, PgAdvisoryLock};
pub use provision::ProvisionReport;
pub use runner::{FailedAt, MigrationRunner, RunReport, RunState};
pub use session::{MigrationSession, PgSession};
