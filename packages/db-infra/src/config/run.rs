use std::str::FromStr;
use std::time::Duration;

use super::{parse_var, process_env};
use crate::error::DbInfraError;

/// Whether applied migrations are recorded in a ledger table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerMode {
    /// Every run executes every migration; safety rests on idempotent SQL
    #[default]
    Disabled,
    /// Applied migrations are recorded and skipped on later runs
    Enabled,
}

impl FromStr for LedgerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" | "false" => Ok(LedgerMode::Disabled),
            "enabled" | "on" | "true" => Ok(LedgerMode::Enabled),
            other => Err(format!("expected 'enabled' or 'disabled', got '{other}'")),
        }
    }
}

/// How concurrent runs against the same database are serialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Session advisory lock held for the whole phase
    #[default]
    Advisory,
    /// No lock; relies on idempotent SQL and "already exists" tolerance
    None,
}

impl FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "advisory" => Ok(LockMode::Advisory),
            "none" | "off" => Ok(LockMode::None),
            other => Err(format!("expected 'advisory' or 'none', got '{other}'")),
        }
    }
}

/// Runner behaviour and deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub ledger: LedgerMode,
    pub lock: LockMode,
    pub lock_timeout: Duration,
    /// Applied as the session `statement_timeout`
    pub statement_timeout: Duration,
    pub connect_timeout: Duration,
    /// 1 means a single attempt, no retry
    pub connect_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ledger: LedgerMode::Disabled,
            lock: LockMode::Advisory,
            lock_timeout: Duration::from_secs(30),
            statement_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 1,
            retry_interval: Duration::from_millis(500),
        }
    }
}

impl RunOptions {
    pub fn from_env() -> Result<Self, DbInfraError> {
        Self::from_lookup(process_env)
    }

    /// Unset variables keep their defaults; malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DbInfraError> {
        let defaults = Self::default();
        let millis = |name: &str, fallback: Duration| -> Result<Duration, DbInfraError> {
            Ok(parse_var::<u64>(&lookup, name)?
                .map(Duration::from_millis)
                .unwrap_or(fallback))
        };

        let connect_attempts =
            parse_var::<u32>(&lookup, "MIGRATE_CONNECT_ATTEMPTS")?.unwrap_or(defaults.connect_attempts);
        if connect_attempts == 0 {
            return Err(DbInfraError::config(
                "Environment variable 'MIGRATE_CONNECT_ATTEMPTS' must be at least 1",
            ));
        }

        Ok(Self {
            ledger: parse_var(&lookup, "MIGRATE_LEDGER")?.unwrap_or(defaults.ledger),
            lock: parse_var(&lookup, "MIGRATE_LOCK")?.unwrap_or(defaults.lock),
            lock_timeout: millis("MIGRATE_LOCK_TIMEOUT_MS", defaults.lock_timeout)?,
            statement_timeout: millis("MIGRATE_STATEMENT_TIMEOUT_MS", defaults.statement_timeout)?,
            connect_timeout: millis("MIGRATE_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            connect_attempts,
            retry_interval: millis("MIGRATE_RETRY_INTERVAL_MS", defaults.retry_interval)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let options = RunOptions::from_lookup(vars(&[])).unwrap();
        assert_eq!(options, RunOptions::default());
        assert_eq!(options.ledger, LedgerMode::Disabled);
        assert_eq!(options.lock, LockMode::Advisory);
        assert_eq!(options.connect_attempts, 1);
    }

    #[test]
    fn test_overrides() {
        let options = RunOptions::from_lookup(vars(&[
            ("MIGRATE_LEDGER", "enabled"),
            ("MIGRATE_LOCK", "none"),
            ("MIGRATE_LOCK_TIMEOUT_MS", "1500"),
            ("MIGRATE_STATEMENT_TIMEOUT_MS", "250"),
            ("MIGRATE_CONNECT_ATTEMPTS", "4"),
        ]))
        .unwrap();
        assert_eq!(options.ledger, LedgerMode::Enabled);
        assert_eq!(options.lock, LockMode::None);
        assert_eq!(options.lock_timeout, Duration::from_millis(1500));
        assert_eq!(options.statement_timeout, Duration::from_millis(250));
        assert_eq!(options.connect_attempts, 4);
    }

    #[test]
    fn test_malformed_values_rejected() {
        let err = RunOptions::from_lookup(vars(&[("MIGRATE_LEDGER", "sometimes")])).unwrap_err();
        assert!(err.to_string().contains("MIGRATE_LEDGER"));

        let err = RunOptions::from_lookup(vars(&[("MIGRATE_LOCK_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("MIGRATE_LOCK_TIMEOUT_MS"));

        let err = RunOptions::from_lookup(vars(&[("MIGRATE_CONNECT_ATTEMPTS", "0")])).unwrap_err();
        assert!(err.to_string().contains("MIGRATE_CONNECT_ATTEMPTS"));
    }
}
