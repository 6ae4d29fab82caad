//! Tracing setup for embedding applications that want the store's logs.

use crate::error::{Result, StoreError};
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber with the given filter string
/// (e.g. `"info"` or `"arbor=debug"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| StoreError::invalid_state(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .try_init()
        .map_err(|_| StoreError::invalid_state("logging already initialized"))
}
