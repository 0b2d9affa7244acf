//! Process bootstrap helpers shared by binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

/// Log filter used when `CONVEYOR_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Filter from `CONVEYOR_LOG`, or [`DEFAULT_LOG_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Initialize tracing with the CONVEYOR_LOG environment variable.
///
/// Defaults to "info" level if CONVEYOR_LOG is not set. Calling this twice
/// in one process panics, as with any global subscriber.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_tracing`], but returns `false` instead of panicking when a
/// subscriber is already installed. Handy in tests.
pub fn try_init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}
