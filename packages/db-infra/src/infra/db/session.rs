use async_trait::async_trait;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait,
};

use super::ledger::{self, LedgerEntry};

/// The statements the runner needs from one database session.
///
/// Implementations keep at most one transaction open. `execute` runs inside it
/// when one is open and in autocommit mode otherwise.
#[async_trait]
pub trait MigrationSession: Send {
    async fn begin(&mut self) -> Result<(), DbErr>;

    /// Run raw SQL, possibly several statements.
    async fn execute(&mut self, sql: &str) -> Result<(), DbErr>;

    async fn commit(&mut self) -> Result<(), DbErr>;

    /// No-op when no transaction is open.
    async fn rollback(&mut self) -> Result<(), DbErr>;

    async fn ensure_ledger(&mut self) -> Result<(), DbErr>;

    /// Checksum recorded for migration `id`, if any.
    async fn recorded_checksum(&mut self, id: i32) -> Result<Option<String>, DbErr>;

    async fn record(&mut self, entry: &LedgerEntry) -> Result<(), DbErr>;
}

/// Session over a single-connection sea-orm pool.
pub struct PgSession {
    conn: DatabaseConnection,
    txn: Option<DatabaseTransaction>,
}

impl PgSession {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn, txn: None }
    }
}

#[async_trait]
impl MigrationSession for PgSession {
    async fn begin(&mut self) -> Result<(), DbErr> {
        if self.txn.is_some() {
            return Err(DbErr::Custom("transaction already open".to_string()));
        }
        self.txn = Some(self.conn.begin().await?);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<(), DbErr> {
        match &self.txn {
            Some(txn) => txn.execute_unprepared(sql).await?,
            None => self.conn.execute_unprepared(sql).await?,
        };
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbErr> {
        match self.txn.take() {
            Some(txn) => txn.commit().await,
            None => Err(DbErr::Custom("no transaction to commit".to_string())),
        }
    }

    async fn rollback(&mut self) -> Result<(), DbErr> {
        match self.txn.take() {
            Some(txn) => txn.rollback().await,
            None => Ok(()),
        }
    }

    async fn ensure_ledger(&mut self) -> Result<(), DbErr> {
        self.execute(ledger::CREATE_LEDGER_SQL).await
    }

    async fn recorded_checksum(&mut self, id: i32) -> Result<Option<String>, DbErr> {
        let stmt = ledger::select_checksum_statement(id);
        let row = match &self.txn {
            Some(txn) => txn.query_one(stmt).await?,
            None => self.conn.query_one(stmt).await?,
        };
        row.map(|row| row.try_get::<String>("", "checksum")).transpose()
    }

    async fn record(&mut self, entry: &LedgerEntry) -> Result<(), DbErr> {
        let stmt = entry.insert_statement();
        match &self.txn {
            Some(txn) => txn.execute(stmt).await?,
            None => self.conn.execute(stmt).await?,
        };
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory session that models transactions and savepoints closely
    //! enough to observe what the runner commits.

    use std::collections::BTreeMap;

    use super::*;

    type FailWhen = Box<dyn Fn(&str) -> bool + Send>;

    #[derive(Default)]
    pub(crate) struct FakeSession {
        /// Every statement seen, framing included
        pub log: Vec<String>,
        /// Migration bodies that reached a commit
        pub committed: Vec<String>,
        pub ledger: BTreeMap<i32, LedgerEntry>,
        pending: Vec<String>,
        pending_ledger: Vec<LedgerEntry>,
        savepoints: Vec<(String, usize, usize)>,
        in_txn: bool,
        fail_when: Option<FailWhen>,
        race_on: Option<String>,
    }

    impl FakeSession {
        pub(crate) fn failing_when(predicate: impl Fn(&str) -> bool + Send + 'static) -> Self {
            Self {
                fail_when: Some(Box::new(predicate)),
                ..Self::default()
            }
        }

        /// The first statement containing `fragment` fails the way Postgres
        /// reports a concurrent creator winning on a catalog index.
        pub(crate) fn racing_on(fragment: &str) -> Self {
            Self {
                race_on: Some(fragment.to_string()),
                ..Self::default()
            }
        }

        /// Tables created by committed or pending work.
        fn tables(&self) -> Vec<String> {
            self.committed
                .iter()
                .chain(self.pending.iter())
                .filter_map(|sql| {
                    sql.split("CREATE TABLE IF NOT EXISTS ")
                        .nth(1)
                        .and_then(|rest| rest.split_whitespace().next())
                        .map(|name| name.trim_end_matches(['(', ';']).to_string())
                })
                .collect()
        }

        fn missing_dependency(&self, sql: &str) -> Option<String> {
            let target = sql
                .split("ALTER TABLE ")
                .nth(1)?
                .split_whitespace()
                .next()?
                .to_string();
            (!self.tables().contains(&target)).then_some(target)
        }
    }

    #[async_trait]
    impl MigrationSession for FakeSession {
        async fn begin(&mut self) -> Result<(), DbErr> {
            self.log.push("BEGIN".to_string());
            self.in_txn = true;
            Ok(())
        }

        async fn execute(&mut self, sql: &str) -> Result<(), DbErr> {
            self.log.push(sql.to_string());

            if let Some(name) = sql.strip_prefix("SAVEPOINT ") {
                self.savepoints
                    .push((name.to_string(), self.pending.len(), self.pending_ledger.len()));
                return Ok(());
            }
            if let Some(name) = sql.strip_prefix("RELEASE SAVEPOINT ") {
                self.savepoints.retain(|(n, _, _)| n != name);
                return Ok(());
            }
            if let Some(name) = sql.strip_prefix("ROLLBACK TO SAVEPOINT ") {
                let Some((_, work, ledger)) =
                    self.savepoints.iter().find(|(n, _, _)| n == name).cloned()
                else {
                    return Err(DbErr::Custom(format!("savepoint {name} does not exist")));
                };
                self.pending.truncate(work);
                self.pending_ledger.truncate(ledger);
                return Ok(());
            }

            if self.race_on.as_deref().is_some_and(|fragment| sql.contains(fragment)) {
                self.race_on = None;
                return Err(DbErr::Custom(
                    "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\" \
                     SQLSTATE(23505)"
                        .to_string(),
                ));
            }
            if self.fail_when.as_ref().is_some_and(|fail| fail(sql)) {
                return Err(DbErr::Custom(format!("syntax error in: {sql}")));
            }
            if let Some(table) = self.missing_dependency(sql) {
                return Err(DbErr::Custom(format!("relation \"{table}\" does not exist")));
            }

            if self.in_txn {
                self.pending.push(sql.to_string());
            } else {
                self.committed.push(sql.to_string());
            }
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), DbErr> {
            self.log.push("COMMIT".to_string());
            self.committed.append(&mut self.pending);
            for entry in self.pending_ledger.drain(..) {
                self.ledger.insert(entry.id, entry);
            }
            self.savepoints.clear();
            self.in_txn = false;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), DbErr> {
            if self.in_txn {
                self.log.push("ROLLBACK".to_string());
            }
            self.pending.clear();
            self.pending_ledger.clear();
            self.savepoints.clear();
            self.in_txn = false;
            Ok(())
        }

        async fn ensure_ledger(&mut self) -> Result<(), DbErr> {
            self.log.push("ENSURE LEDGER".to_string());
            Ok(())
        }

        async fn recorded_checksum(&mut self, id: i32) -> Result<Option<String>, DbErr> {
            Ok(self.ledger.get(&id).map(|entry| entry.checksum.clone()))
        }

        async fn record(&mut self, entry: &LedgerEntry) -> Result<(), DbErr> {
            self.pending_ledger.push(entry.clone());
            Ok(())
        }
    }
}
