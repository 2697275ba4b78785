use std::fmt;

use sea_orm::DbErr;
use thiserror::Error;

/// Credential tier a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Elevated credentials used to provision the target role and database
    Admin,
    /// Credentials that own and evolve the application schema
    Target,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Admin => f.write_str("admin"),
            Tier::Target => f.write_str("target"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DbInfraError {
    #[error("Configuration error: {message}")]
    Config { message: String },
    #[error("Connection error ({tier} tier): {message}")]
    Connection { tier: Tier, message: String },
    #[error("Provisioning error during {step}: {message}")]
    Provisioning { step: &'static str, message: String },
    #[error("Migration {index} ({name}) failed: {source}")]
    Migration {
        index: usize,
        name: String,
        source: DbErr,
    },
    #[error(
        "Migration {index} changed after it was applied (recorded checksum {recorded}, current {current})"
    )]
    ChecksumMismatch {
        index: usize,
        recorded: String,
        current: String,
    },
    #[error("Ledger error: {message}")]
    Ledger { message: String },
    #[error("Migration lock error: {message}")]
    Lock { message: String },
    #[error("Status query failed: {message}")]
    Query { message: String },
    #[error("Cancelled during {phase}")]
    Cancelled { phase: &'static str },
    #[error("Timed out during {phase} after {elapsed_ms}ms")]
    Timeout { phase: &'static str, elapsed_ms: u128 },
}

impl DbInfraError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn provisioning(step: &'static str, err: DbErr) -> Self {
        Self::Provisioning {
            step,
            message: err.to_string(),
        }
    }

    /// Index of the failing migration, for errors raised while applying one.
    pub fn migration_index(&self) -> Option<usize> {
        match self {
            Self::Migration { index, .. } | Self::ChecksumMismatch { index, .. } => Some(*index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_error_names_index_and_cause() {
        let err = DbInfraError::Migration {
            index: 3,
            name: "create_games".to_string(),
            source: DbErr::Custom("relation \"games\" already exists".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("Migration 3"));
        assert!(msg.contains("create_games"));
        assert!(msg.contains("already exists"));
        assert_eq!(err.migration_index(), Some(3));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_connection_error_names_tier() {
        let err = DbInfraError::Connection {
            tier: Tier::Admin,
            message: "password authentication failed".to_string(),
        };
        assert!(err.to_string().contains("admin tier"));
        assert_eq!(err.migration_index(), None);
    }
}
