//! Test support utilities for migration tests
//!
//! Unique, Postgres-safe names so concurrent test runs never collide, a
//! throwaway database descriptor built from `TEST_POSTGRES_*` variables, and
//! idempotent logging setup.

pub mod logging;
pub mod postgres;

use ulid::Ulid;

/// Generate a unique Postgres identifier with the given prefix
///
/// The result is lowercase and underscore-separated so it needs no quoting
/// and stays well under the 63-byte identifier limit for short prefixes.
///
/// # Examples
/// ```
/// use test_support::unique_ident;
///
/// let a = unique_ident("games");
/// let b = unique_ident("games");
/// assert_ne!(a, b);
/// assert!(a.starts_with("games_"));
/// assert_eq!(a, a.to_lowercase());
/// ```
pub fn unique_ident(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ident_produces_different_results() {
        assert_ne!(unique_ident("test"), unique_ident("test"));
    }

    #[test]
    fn test_unique_ident_is_plain_identifier() {
        let ident = unique_ident("migrate_db");
        assert!(ident.starts_with("migrate_db_"));
        assert!(ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        assert!(ident.len() < 63);
    }
}
