//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "OUTBOX_LOG";

/// Installs a fmt subscriber filtered by `OUTBOX_LOG`, defaulting to `info`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    init_tracing_with_filter("info")
}

/// Like [`init_tracing`] with a caller-chosen default directive.
pub fn init_tracing_with_filter(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
