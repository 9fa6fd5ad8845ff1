//! Structured logging setup
//!
//! Installs a `tracing_subscriber` registry with an `EnvFilter` and the fmt
//! layer. `RUST_LOG` wins over the configured level when it is set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{GridCacheError, GridCacheResult};

/// Build the filter: `RUST_LOG` if present, else `config.level`
pub fn build_filter(config: &LoggingConfig) -> GridCacheResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    config.validate()?;
    EnvFilter::try_new(&config.level)
        .map_err(|e| GridCacheError::configuration("logging.level", e.to_string()))
}

/// Install the global subscriber
///
/// Returns `Ok(false)` if another subscriber was already installed, so it is
/// safe to call from every test and every client constructor.
pub fn try_init(config: &LoggingConfig) -> GridCacheResult<bool> {
    let filter = build_filter(config)?;
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(config.ansi))
        .try_init()
        .is_ok();
    Ok(installed)
}

/// Install the global subscriber, failing if one is already installed
pub fn init(config: &LoggingConfig) -> GridCacheResult<()> {
    if try_init(config)? {
        Ok(())
    } else {
        Err(GridCacheError::logging_init(
            "a global tracing subscriber is already installed",
        ))
    }
}
