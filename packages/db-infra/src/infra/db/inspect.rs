//! Catalog queries over the `public` schema, used by `status` and by tests
//! that check what a run left behind.

use std::collections::BTreeMap;

use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, Statement};

/// Base tables in `public`, sorted by name.
pub async fn list_tables<C: ConnectionTrait>(conn: &C) -> Result<Vec<String>, DbErr> {
    let rows = conn
        .query_all(Statement::from_string(
            DatabaseBackend::Postgres,
            "SELECT table_name::text AS table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
        ))
        .await?;

    rows.iter()
        .map(|row| row.try_get::<String>("", "table_name"))
        .collect()
}

pub async fn table_exists<C: ConnectionTrait>(conn: &C, table: &str) -> Result<bool, DbErr> {
    let row = conn
        .query_one(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1",
            vec![table.into()],
        ))
        .await?;
    Ok(row.is_some())
}

/// Column name to `information_schema` data type, e.g. `"turn" => "smallint"`.
pub async fn table_columns<C: ConnectionTrait>(
    conn: &C,
    table: &str,
) -> Result<BTreeMap<String, String>, DbErr> {
    let rows = conn
        .query_all(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT column_name::text AS column_name, data_type::text AS data_type \
             FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1",
            vec![table.into()],
        ))
        .await?;

    rows.iter()
        .map(|row| -> Result<(String, String), DbErr> {
            Ok((
                row.try_get("", "column_name")?,
                row.try_get("", "data_type")?,
            ))
        })
        .collect()
}
