//! Throwaway target databases for integration tests.
//!
//! A test server is described by `TEST_POSTGRES_*` variables. Each
//! [`TestDatabase`] pairs those admin credentials with a freshly named target
//! role and database, exposed under the production `POSTGRES_*` names so the
//! real resolver can read them.

use std::collections::HashMap;

use ulid::Ulid;

use crate::unique_ident;

/// Variable that switches database tests on.
pub const HOST_VAR: &str = "TEST_POSTGRES_HOST";

#[derive(Debug, Clone)]
pub struct TestDatabase {
    vars: HashMap<String, String>,
}

impl TestDatabase {
    /// `None` when no test server is configured.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let test_var = |name: &str| lookup(&format!("TEST_{name}")).filter(|v| !v.is_empty());

        let host = test_var("POSTGRES_HOST")?;
        let mut vars = HashMap::new();
        vars.insert("POSTGRES_HOST".to_string(), host);
        vars.insert(
            "POSTGRES_PORT".to_string(),
            test_var("POSTGRES_PORT").unwrap_or_else(|| "5432".to_string()),
        );
        vars.insert(
            "POSTGRES_ADMIN_USER".to_string(),
            test_var("POSTGRES_ADMIN_USER").unwrap_or_else(|| "postgres".to_string()),
        );
        for name in ["POSTGRES_ADMIN_PASS", "POSTGRES_ADMIN_NAME", "POSTGRES_CERTS"] {
            if let Some(value) = test_var(name) {
                vars.insert(name.to_string(), value);
            }
        }

        vars.insert("POSTGRES_USER".to_string(), unique_ident("migrate_user"));
        vars.insert("POSTGRES_NAME".to_string(), unique_ident("migrate_db"));
        vars.insert("POSTGRES_PASS".to_string(), Ulid::new().to_string());

        Some(Self { vars })
    }

    /// Lookup over the generated `POSTGRES_*` variables.
    pub fn lookup(&self) -> impl Fn(&str) -> Option<String> + '_ {
        move |name: &str| self.vars.get(name).cloned()
    }

    pub fn username(&self) -> &str {
        &self.vars["POSTGRES_USER"]
    }

    pub fn database(&self) -> &str {
        &self.vars["POSTGRES_NAME"]
    }
}

/// Print a skip notice and return `None` when no test server is configured.
pub fn test_database_or_skip(test: &str) -> Option<TestDatabase> {
    let db = TestDatabase::from_env();
    if db.is_none() {
        println!("skipping {test}: {HOST_VAR} is not set");
    }
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str) -> Option<String> {
        match name {
            "TEST_POSTGRES_HOST" => Some("localhost".to_string()),
            "TEST_POSTGRES_ADMIN_PASS" => Some("admin".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_unconfigured_server_is_none() {
        assert!(TestDatabase::from_lookup(|_| None).is_none());
    }

    #[test]
    fn test_maps_to_production_names() {
        let db = TestDatabase::from_lookup(server).unwrap();
        let lookup = db.lookup();
        assert_eq!(lookup("POSTGRES_HOST").as_deref(), Some("localhost"));
        assert_eq!(lookup("POSTGRES_PORT").as_deref(), Some("5432"));
        assert_eq!(lookup("POSTGRES_ADMIN_USER").as_deref(), Some("postgres"));
        assert_eq!(lookup("POSTGRES_ADMIN_PASS").as_deref(), Some("admin"));
        assert_eq!(lookup("POSTGRES_CERTS"), None);
        assert_eq!(lookup("POSTGRES_USER").as_deref(), Some(db.username()));
        assert!(db.database().starts_with("migrate_db_"));
    }

    #[test]
    fn test_each_database_is_fresh() {
        let a = TestDatabase::from_lookup(server).unwrap();
        let b = TestDatabase::from_lookup(server).unwrap();
        assert_ne!(a.database(), b.database());
        assert_ne!(a.username(), b.username());
    }
}
