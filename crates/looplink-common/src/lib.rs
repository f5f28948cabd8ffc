//! Shared utilities for Looplink: logging and environment helpers.

#![forbid(unsafe_code)]

pub mod helpers;

pub use helpers::env_bool;

/// Environment variable that turns coloured log output on or off.
pub const LOG_COLOR_ENV: &str = "LOOPLINK_LOG_COLOR";

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set. Logs go to stderr; stdout may be
/// carrying the host transport.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second initialization (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(env_bool(LOG_COLOR_ENV, true))
        .with_writer(std::io::stderr)
        .try_init();
}
