//! Env-var resolution helpers shared by the config sections.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating empty values as absent.
pub(crate) fn optional_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// Read a required env var.
pub(crate) fn require_env(var: &str) -> Result<String, ConfigError> {
    optional_env(var).ok_or_else(|| ConfigError::MissingEnv {
        var: var.to_string(),
    })
}

/// Read and parse an env var, falling back to `default` when unset.
pub(crate) fn parse_env<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(var) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidEnv {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
