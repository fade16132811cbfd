use crate::error::{AgError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber filtered by `filter`
/// (an `EnvFilter` directive such as `"agmap=debug"`).
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| AgError::Config(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| AgError::Config("logging already initialized".into()))
}
