//! Optional record of applied migrations.
//!
//! Rows are written inside the migration's own savepoint, so a migration and
//! its ledger row commit or vanish together.

use migration::Migration;
use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, Statement, Value};
use xxhash_rust::xxh3::xxh3_64;

pub const LEDGER_TABLE: &str = "schema_migrations";

pub(crate) const CREATE_LEDGER_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        id INT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        checksum TEXT NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
"#;

pub(crate) const SELECT_CHECKSUM_SQL: &str = "SELECT checksum FROM schema_migrations WHERE id = $1";

pub(crate) const INSERT_ENTRY_SQL: &str =
    "INSERT INTO schema_migrations (id, name, checksum) VALUES ($1, $2, $3)";

const LIST_ENTRIES_SQL: &str =
    "SELECT id, name, checksum, applied_at::text AS applied_at FROM schema_migrations ORDER BY id";

/// Fingerprint of a migration's SQL text.
pub fn checksum(sql: &str) -> String {
    format!("{:016x}", xxh3_64(sql.as_bytes()))
}

/// Row about to be written for a migration at `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: i32,
    pub name: String,
    pub checksum: String,
}

impl LedgerEntry {
    pub fn for_migration(id: i32, migration: &Migration) -> Self {
        Self {
            id,
            name: migration.name().to_string(),
            checksum: checksum(migration.sql()),
        }
    }

    pub(crate) fn insert_statement(&self) -> Statement {
        Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            INSERT_ENTRY_SQL,
            vec![
                Value::from(self.id),
                Value::from(self.name.clone()),
                Value::from(self.checksum.clone()),
            ],
        )
    }
}

pub(crate) fn select_checksum_statement(id: i32) -> Statement {
    Statement::from_sql_and_values(DatabaseBackend::Postgres, SELECT_CHECKSUM_SQL, vec![id.into()])
}

/// A recorded migration as read back for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub id: i32,
    pub name: String,
    pub checksum: String,
    pub applied_at: String,
}

/// All ledger rows in id order. Callers check the table exists first.
pub async fn load<C>(conn: &C) -> Result<Vec<AppliedMigration>, DbErr>
where
    C: ConnectionTrait,
{
    let rows = conn
        .query_all(Statement::from_string(
            DatabaseBackend::Postgres,
            LIST_ENTRIES_SQL,
        ))
        .await?;

    rows.into_iter()
        .map(|row| -> Result<AppliedMigration, DbErr> {
            Ok(AppliedMigration {
                id: row.try_get("", "id")?,
                name: row.try_get("", "name")?,
                checksum: row.try_get("", "checksum")?,
                applied_at: row.try_get("", "applied_at")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_tracks_sql_text() {
        let a = checksum("CREATE TABLE IF NOT EXISTS games (id UUID)");
        let b = checksum("CREATE TABLE IF NOT EXISTS games (id UUID)");
        let c = checksum("CREATE TABLE IF NOT EXISTS games (id UUID, turn INT2)");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_entry_for_migration() {
        let migration = Migration::new("create_games", "SELECT 1");
        let entry = LedgerEntry::for_migration(2, &migration);
        assert_eq!(entry.id, 2);
        assert_eq!(entry.name, "create_games");
        assert_eq!(entry.checksum, checksum("SELECT 1"));

        let stmt = entry.insert_statement();
        assert_eq!(stmt.sql, INSERT_ENTRY_SQL);
        assert_eq!(stmt.values.map(|v| v.0.len()), Some(3));
    }
}
