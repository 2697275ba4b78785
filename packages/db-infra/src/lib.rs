//! Shared database configuration and migration infrastructure.
//! Used by the migration CLI and by service test harnesses.

pub mod config;
pub mod error;
pub mod infra;

pub use config::db;
pub use config::run::{LedgerMode, LockMode, RunOptions};
pub use error::{DbInfraError, Tier};
pub use infra::db::{
    clean, migrate_target, orchestrate_migration, provision, status, FailedAt, Outcome,
    ProvisionReport, RunReport, RunState, Status,
};
