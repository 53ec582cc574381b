//! Logging setup for the provider binary.
//!
//! Events go to **stderr**; stdout belongs to the host handshake.
//!
//! ```ignore
//! use hemmer_provider_cloudstack::init_logging;
//!
//! init_logging();
//! tracing::info!("Starting CloudStack provider");
//! ```
//!
//! Filtering follows `RUST_LOG`, e.g.:
//!
//! ```bash
//! # tag diffs, ID lookups and async job polling
//! RUST_LOG=hemmer_provider_cloudstack=debug ./hemmer-provider-cloudstack
//!
//! # signed request URLs (contain the API key, never the secret)
//! RUST_LOG=hemmer_provider_cloudstack::client=trace ./hemmer-provider-cloudstack
//! ```

use tracing_subscriber::{fmt, prelude::*, registry::Registry, EnvFilter};

const DEFAULT_LEVEL: &str = "info";

/// `RUST_LOG` when set and valid, `default_level` otherwise.
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn subscriber(filter: EnvFilter) -> impl tracing::Subscriber + Send + Sync {
    Registry::default().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    )
}

/// Install the global subscriber at `info` unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_LEVEL);
}

/// Like [`init_logging`], with a different fallback level.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    subscriber(env_filter(default_level)).init();
}

/// Like [`init_logging`], but returns `false` instead of panicking when a
/// subscriber is already installed.
pub fn try_init_logging() -> bool {
    subscriber(env_filter(DEFAULT_LEVEL)).try_init().is_ok()
}
