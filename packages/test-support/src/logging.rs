//! Tracing setup shared by unit and integration tests.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Shows the orchestrator's own phase lines; sqlx only when it fails.
pub const DEFAULT_DIRECTIVES: &str = "warn,db_infra=info,sqlx=error";

/// Filter directives for test output: `MIGRATE_TEST_LOG`, then `RUST_LOG`,
/// then [`DEFAULT_DIRECTIVES`]. Blank values count as unset.
pub fn filter_directives<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ["MIGRATE_TEST_LOG", "RUST_LOG"]
        .into_iter()
        .filter_map(lookup)
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string())
}

/// Install the test subscriber once per process. Safe to call from every
/// test; a subscriber installed by someone else is left alone.
pub fn init() {
    INITIALIZED.get_or_init(|| {
        let directives = filter_directives(|name| std::env::var(name).ok());
        let filter = EnvFilter::try_new(&directives)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .with_target(true)
            .try_init()
            .ok();
    });
}
