//! Schema registries for the services that migrate at startup.
//!
//! Every service owns a fixed, ordered list of [`Migration`]s. Order is
//! significant: a migration may rely on objects created by the ones before it.
//! The runner frames each entry in its own transaction and savepoint, so the
//! SQL here carries no `BEGIN`/`COMMIT` of its own.

use std::borrow::Cow;

mod auth_server;
mod draughts;
mod naughts_and_crosses;

/// One schema-change unit: an opaque block of SQL, possibly several statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    name: Cow<'static, str>,
    sql: Cow<'static, str>,
}

impl Migration {
    /// Registry entry known at compile time.
    pub const fn new(name: &'static str, sql: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            sql: Cow::Borrowed(sql),
        }
    }

    /// Entry built at runtime (test harnesses, generated names).
    pub fn owned(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            sql: Cow::Owned(sql.into()),
        }
    }

    /// Short label used in logs and the ledger
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Services that ship a schema registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    NaughtsAndCrosses,
    Draughts,
    AuthServer,
}

impl Service {
    pub const ALL: [Service; 3] = [
        Service::NaughtsAndCrosses,
        Service::Draughts,
        Service::AuthServer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Service::NaughtsAndCrosses => "naughts-and-crosses",
            Service::Draughts => "draughts",
            Service::AuthServer => "auth-server",
        }
    }

    /// The service's ordered migration list.
    pub fn migrations(self) -> &'static [Migration] {
        match self {
            Service::NaughtsAndCrosses => naughts_and_crosses::MIGRATIONS,
            Service::Draughts => draughts::MIGRATIONS,
            Service::AuthServer => auth_server::MIGRATIONS,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_every_service_has_migrations() {
        for service in Service::ALL {
            assert!(
                !service.migrations().is_empty(),
                "{} has no migrations",
                service.name()
            );
        }
    }

    #[test]
    fn test_migration_names_unique_per_service() {
        for service in Service::ALL {
            let mut seen = HashSet::new();
            for migration in service.migrations() {
                assert!(
                    seen.insert(migration.name()),
                    "{} repeats migration name {}",
                    service.name(),
                    migration.name()
                );
            }
        }
    }

    #[test]
    fn test_registry_sql_has_no_transaction_framing() {
        for service in Service::ALL {
            for migration in service.migrations() {
                let upper = migration.sql().to_uppercase();
                for keyword in ["BEGIN;", "COMMIT;", "SAVEPOINT", "ROLLBACK"] {
                    assert!(
                        !upper.contains(keyword),
                        "{}/{} contains {keyword}",
                        service.name(),
                        migration.name()
                    );
                }
            }
        }
    }

    #[test]
    fn test_registry_creates_are_guarded() {
        for service in Service::ALL {
            for migration in service.migrations() {
                let upper = migration.sql().to_uppercase();
                let creates = upper.matches("CREATE TABLE").count();
                let guarded = upper.matches("CREATE TABLE IF NOT EXISTS").count();
                assert_eq!(
                    creates,
                    guarded,
                    "{}/{} has an unguarded CREATE TABLE",
                    service.name(),
                    migration.name()
                );

                let adds = upper.matches("ADD COLUMN").count();
                let guarded_adds = upper.matches("ADD COLUMN IF NOT EXISTS").count();
                assert_eq!(adds, guarded_adds);
            }
        }
    }

    #[test]
    fn test_owned_and_static_compare_equal() {
        let a = Migration::new("x", "SELECT 1");
        let b = Migration::owned("x", "SELECT 1".to_string());
        assert_eq!(a, b);
        assert_eq!(b.sql(), "SELECT 1");
    }
}
