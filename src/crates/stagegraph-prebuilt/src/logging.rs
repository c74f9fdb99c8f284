//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{PrebuiltError, Result};
use tracing_subscriber::EnvFilter;

/// Build the filter for `config`, preferring `RUST_LOG`
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            PrebuiltError::config(format!("invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Install the global subscriber
///
/// Calling this again once a subscriber is installed is a no-op. An invalid
/// level is reported either way.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config)?)
        .with_ansi(config.colored);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Full => builder.try_init(),
    };
    match installed {
        Ok(()) => Ok(()),
        Err(_) if tracing::dispatcher::has_been_set() => {
            tracing::debug!("Global subscriber already installed, keeping it");
            Ok(())
        }
        Err(e) => Err(PrebuiltError::config(format!("failed to install logger: {}", e))),
    }
}
