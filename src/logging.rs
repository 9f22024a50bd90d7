//! Structured logging setup, installed once before any other component runs.

use crate::config::LoggingConfig;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Install a UTC-timestamped `tracing_subscriber::fmt` subscriber. Level is
/// `TRACE` when `config.debug` is set, `INFO` otherwise; a `RUST_LOG`
/// environment variable, if present, takes precedence over both.
pub fn init(config: &LoggingConfig) {
    let default_level = if config.debug { "trace" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .init();
}
