//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events. Applications and tests that want to see
//! them call [`init_logging`] once; later calls are no-ops.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configured filter
pub const LOG_ENV_VAR: &str = "MDEV_PROTOCOL_LOG";

/// Build the filter from `MDEV_PROTOCOL_LOG`, falling back to the configured level
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()))
}

/// Install a global `fmt` subscriber
///
/// Returns `false` if logging is disabled or a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    if !config.log_to_console {
        return false;
    }
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);
    let installed = if config.json_format {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::debug!(app = %config.app_name, "Logging initialized");
    }
    installed
}
