//! Structured logging setup.
//!
//! Thin wrapper over `tracing-subscriber` driven by
//! [`LoggingConfig`](crate::config::LoggingConfig); the rest of the crate
//! only ever talks to `tracing` macros.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber from config. Call once at startup; a second
/// call reports an error instead of panicking.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| ProtocolError::ConfigError(format!("invalid log level: {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log_targets);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| ProtocolError::ConfigError(format!("failed to install subscriber: {e}")))
}
