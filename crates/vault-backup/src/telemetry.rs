//! Structured logging setup.
//!
//! # Telemetry invariants
//!
//! - **No key material** must appear in any log field: unseal keys, root
//!   tokens and credential blobs are only ever logged by name.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`); `RUST_LOG`
//!   takes precedence when set.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise the global JSON tracing subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(log_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing subscriber: {e}"))
}
