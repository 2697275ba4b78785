//! Configuration resolved from the process environment.
//!
//! Resolution never touches the network or the filesystem. Everything reads
//! through a lookup function so callers (and tests) can supply values without
//! mutating the process environment.

pub mod db;
pub mod run;

use std::str::FromStr;

use crate::error::DbInfraError;

/// Lookup backed by the process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Optional variable; set-but-blank counts as unset.
fn optional_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).filter(|value| !value.trim().is_empty())
}

/// Get required variable or return error
fn must_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, DbInfraError> {
    optional_var(lookup, name).ok_or_else(|| {
        DbInfraError::config(format!("Required environment variable '{name}' is not set"))
    })
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, DbInfraError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(lookup, name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                DbInfraError::config(format!("Environment variable '{name}' is invalid: {e}"))
            })
        })
        .transpose()
}
