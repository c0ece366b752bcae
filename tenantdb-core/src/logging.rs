//! Logging setup.
//!
//! The crate logs through `tracing`. Applications that already install a
//! subscriber need nothing from this module. Otherwise, with the
//! `tracing-subscriber` feature enabled, [`init`] installs one driven by the
//! environment:
//!
//! - `TENANTDB_DEBUG=true|1|yes` - Enable debug logging
//! - `TENANTDB_LOG_LEVEL=trace|debug|info|warn|error` - Set the level
//! - `TENANTDB_LOG_FORMAT=json|pretty|compact` - Set the output format (default: json)
//!
//! ```rust,no_run
//! use tenantdb_core::logging;
//!
//! logging::init();
//! ```
//!
//! Pool lifecycle events are logged at `debug`, evictions and shutdown at
//! `info`, and close failures and drain timeouts at `warn`.

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Check if debug logging is enabled via `TENANTDB_DEBUG`.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var("TENANTDB_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Get the log level from `TENANTDB_LOG_LEVEL`.
///
/// Defaults to "debug" if `TENANTDB_DEBUG` is enabled, otherwise "warn".
pub fn get_log_level() -> &'static str {
    env::var("TENANTDB_LOG_LEVEL")
        .ok()
        .and_then(|level| parse_level(&level))
        .unwrap_or_else(default_level)
}

/// Get the log format from `TENANTDB_LOG_FORMAT`.
pub fn get_log_format() -> &'static str {
    env::var("TENANTDB_LOG_FORMAT")
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "compact" => "compact",
            _ => "json",
        })
        .unwrap_or("json")
}

fn parse_level(level: &str) -> Option<&'static str> {
    let level = level.trim().to_lowercase();
    LEVELS.into_iter().find(|l| *l == level)
}

fn default_level() -> &'static str {
    if is_debug_enabled() { "debug" } else { "warn" }
}

/// Install the logging subscriber. Subsequent calls are no-ops.
///
/// Does nothing unless `TENANTDB_DEBUG` or `TENANTDB_LOG_LEVEL` is set.
pub fn init() {
    if !is_debug_enabled() && env::var("TENANTDB_LOG_LEVEL").is_err() {
        return;
    }
    install(get_log_level());
}

/// Install the logging subscriber at a specific level, ignoring the
/// environment. Unknown levels fall back to "warn".
pub fn init_with_level(level: &str) {
    install(parse_level(level).unwrap_or("warn"));
}

#[cfg_attr(not(feature = "tracing-subscriber"), allow(unused_variables))]
fn install(level: &'static str) {
    INIT.call_once(|| {
        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let filter = EnvFilter::try_new(format!(
                "tenantdb={},tenantdb_core={},tenantdb_postgres={}",
                level, level, level
            ))
            .unwrap_or_else(|_| EnvFilter::new("warn"));

            let registry = tracing_subscriber::registry().with(filter);
            let installed = match get_log_format() {
                "json" => registry.with(fmt::layer().json()).try_init(),
                "compact" => registry.with(fmt::layer().compact()).try_init(),
                _ => registry.with(fmt::layer().pretty()).try_init(),
            };

            if installed.is_ok() {
                tracing::info!(level, format = get_log_format(), "tenantdb logging initialized");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Some("debug"));
        assert_eq!(parse_level(" info "), Some("info"));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn test_log_level_default() {
        // SAFETY: no other test reads these variables.
        unsafe {
            env::remove_var("TENANTDB_DEBUG");
            env::remove_var("TENANTDB_LOG_LEVEL");
        }
        assert!(!is_debug_enabled());
        assert_eq!(get_log_level(), "warn");
    }
}
