//! Tracing bootstrap for the CLI.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. Level comes from `LOG_LEVEL` (default
/// `warn`); logs go to stderr so reports on stdout stay machine-readable.
pub fn init(json: bool) {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };
    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!(target: "telemetry", log_level = %level, json, "telemetry initialized");
    }
}
