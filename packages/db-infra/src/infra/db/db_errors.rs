//! SQLSTATE helpers over `sea_orm::DbErr`.

use sea_orm::{DbErr, RuntimeErr};

/// `duplicate_object`: role already exists
pub const DUPLICATE_OBJECT: &str = "42710";
/// `duplicate_database`
pub const DUPLICATE_DATABASE: &str = "42P04";
/// `duplicate_table`
pub const DUPLICATE_TABLE: &str = "42P07";
/// `unique_violation`, raised by catalog indexes when two sessions create the
/// same object at once
pub const UNIQUE_VIOLATION: &str = "23505";

fn mentions_sqlstate(msg: &str, code: &str) -> bool {
    msg.contains(&format!("SQLSTATE({code})")) || msg.contains(&format!("code: {code}"))
}

/// SQLSTATE reported by the server, when the error came from one.
pub fn sqlstate(err: &DbErr) -> Option<String> {
    let runtime = match err {
        DbErr::Exec(runtime) | DbErr::Query(runtime) | DbErr::Conn(runtime) => runtime,
        _ => return None,
    };
    match runtime {
        RuntimeErr::SqlxError(sqlx_err) => database_code(sqlx_err),
        _ => None,
    }
}

fn database_code(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .map(|code| code.into_owned())
}

/// True when `err` is one of the given SQLSTATEs, falling back to the
/// rendered message for errors that lost their structure.
pub fn is_sqlstate(err: &DbErr, codes: &[&str]) -> bool {
    if let Some(code) = sqlstate(err) {
        return codes.contains(&code.as_str());
    }
    let msg = err.to_string();
    codes.iter().any(|code| mentions_sqlstate(&msg, code))
}

/// A concurrent creator won the race for a role or database.
pub fn is_already_exists(err: &DbErr) -> bool {
    is_sqlstate(err, &[DUPLICATE_OBJECT, DUPLICATE_DATABASE])
        || (sqlstate(err).is_none() && err.to_string().contains("already exists"))
}

/// Lost a catalog race: another session committed the same role, database,
/// table or type while this statement was waiting on it.
pub fn is_concurrent_duplicate(err: &DbErr) -> bool {
    is_sqlstate(
        err,
        &[UNIQUE_VIOLATION, DUPLICATE_TABLE, DUPLICATE_OBJECT, DUPLICATE_DATABASE],
    )
}

/// Concurrent `GRANT`s on one database row fail with an internal error
/// rather than a dedicated SQLSTATE.
pub fn is_concurrent_update(err: &DbErr) -> bool {
    err.to_string().contains("tuple concurrently updated")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_errors_have_no_sqlstate() {
        let err = DbErr::Custom("boom".to_string());
        assert_eq!(sqlstate(&err), None);
        assert!(!is_already_exists(&err));
    }

    #[test]
    fn test_message_fallback() {
        let err = DbErr::Custom("error returned from database: SQLSTATE(42P04)".to_string());
        assert!(is_sqlstate(&err, &[DUPLICATE_DATABASE]));
        assert!(is_already_exists(&err));

        let err = DbErr::Custom("role \"games\" already exists".to_string());
        assert!(is_already_exists(&err));

        let err = DbErr::Custom("SQLSTATE(42501) permission denied".to_string());
        assert!(!is_already_exists(&err));
    }

    #[test]
    fn test_runtime_error_message() {
        let err = DbErr::Exec(RuntimeErr::Internal("code: 42710".to_string()));
        assert!(is_sqlstate(&err, &[DUPLICATE_OBJECT]));
        assert!(!is_sqlstate(&err, &[DUPLICATE_TABLE]));
    }

    #[test]
    fn test_catalog_race_is_a_concurrent_duplicate() {
        let err = DbErr::Exec(RuntimeErr::Internal(
            "duplicate key value violates unique constraint \"pg_authid_rolname_index\" \
             SQLSTATE(23505)"
                .to_string(),
        ));
        assert!(is_concurrent_duplicate(&err));
        assert!(!is_already_exists(&err));

        let err = DbErr::Custom("SQLSTATE(42P07) relation \"games\" already exists".to_string());
        assert!(is_concurrent_duplicate(&err));

        let err = DbErr::Custom("SQLSTATE(42601) syntax error".to_string());
        assert!(!is_concurrent_duplicate(&err));
    }

    #[test]
    fn test_concurrent_grant() {
        let err = DbErr::Exec(RuntimeErr::Internal("tuple concurrently updated".to_string()));
        assert!(is_concurrent_update(&err));
        assert!(!is_concurrent_update(&DbErr::Custom("boom".to_string())));
    }
}
