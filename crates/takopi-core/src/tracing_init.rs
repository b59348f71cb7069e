//! Tracing/logging initialization shared by Takopi entry points.
//!
//! Transports embedding the runner call [`init_tracing`] once at startup;
//! the filter comes from `RUST_LOG` with a caller-supplied fallback
//! (e.g. `"takopi=info"`), and JSON output is a flag because bridge
//! deployments usually log into a collector rather than a terminal.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber. Panics if a subscriber is
/// already installed; see [`try_init_tracing`] for the fallible variant.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    #[allow(clippy::expect_used)]
    try_init_tracing(default_filter, log_json).expect("tracing subscriber already installed");
}

/// Like [`init_tracing`], but returns an error instead of panicking when a
/// global subscriber is already set (tests, embedded use).
pub fn try_init_tracing(
    default_filter: &str,
    log_json: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(Into::into)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(Into::into)
    }
}
