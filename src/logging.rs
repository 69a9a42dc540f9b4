//! Process-wide `tracing` setup for binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{PenumbraError, Result};

/// Installs a `tracing` subscriber filtered by `level` (an `EnvFilter` directive
/// such as `"info"` or `"penumbra::storage=debug"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|_| PenumbraError::Invalid("invalid log filter directive"))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| PenumbraError::Invalid("logging already initialized"))
}
