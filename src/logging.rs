//! Tracing subscriber setup for hosts.

use crate::error::{BridgeError, Result};
use tracing_subscriber::EnvFilter;

/// Directive used when neither a filter nor `RUST_LOG` is given
pub const DEFAULT_FILTER: &str = "ajs_bridge=info";

/// Install a fmt subscriber filtered by `filter`
///
/// Fails when the filter does not parse or a global subscriber is already
/// installed.
pub fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|e| BridgeError::InvalidState(format!("invalid log filter: {}", e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| BridgeError::InvalidState(format!("tracing already initialized: {}", e)))
}

/// Install a subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`]
pub fn init_from_env() -> Result<()> {
    let filter = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    init_tracing(&filter)
}
