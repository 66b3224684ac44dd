//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "time_broker=info";

/// Initialize tracing. Callers may install their own subscriber first; this
/// helper installs an env-filtered fmt subscriber only if none is set.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
