//! Configuration for the gridcache client
//!
//! Configuration can come from defaults, a TOML file, or `GRIDCACHE_*`
//! environment variables. Every source ends in [`ClientConfig::validate`].
//!
//! ```toml
//! client_name = "orders-service"
//!
//! [executor]
//! preflight_reachability_check = true
//! slow_operation_threshold = "250ms"
//!
//! [logging]
//! level = "debug"
//! ansi = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GridCacheError, GridCacheResult};

pub mod defaults;

pub use defaults::*;

/// Root configuration structure for a gridcache client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name reported in logs
    pub client_name: String,

    /// Entry processor execution settings
    pub executor: ExecutorConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

/// Entry processor executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Ask the router whether the key's owner is reachable before routing
    pub preflight_reachability_check: bool,

    /// Operations slower than this are logged at warn level
    #[serde(with = "humantime_serde")]
    pub slow_operation_threshold: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Colourise output
    pub ansi: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            executor: ExecutorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            preflight_reachability_check: DEFAULT_PREFLIGHT_REACHABILITY_CHECK,
            slow_operation_threshold: duration_millis(DEFAULT_SLOW_OPERATION_THRESHOLD_MS),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            ansi: DEFAULT_LOG_ANSI,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> GridCacheResult<Self> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> GridCacheResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> GridCacheResult<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("GRIDCACHE_CLIENT_NAME") {
            config.client_name = name;
        }

        config.executor = ExecutorConfig::from_env()?;
        config.logging = LoggingConfig::from_env()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridCacheResult<()> {
        if self.client_name.trim().is_empty() {
            return Err(GridCacheError::configuration(
                "client_name",
                "client_name must not be empty",
            ));
        }

        self.executor.validate()?;
        self.logging.validate()?;

        Ok(())
    }
}

impl ExecutorConfig {
    pub fn from_env() -> GridCacheResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("GRIDCACHE_PREFLIGHT_CHECK") {
            config.preflight_reachability_check = parse_bool("GRIDCACHE_PREFLIGHT_CHECK", &value)?;
        }

        config.slow_operation_threshold = parse_duration_from_env(
            "GRIDCACHE_SLOW_OPERATION_MS",
            config.slow_operation_threshold,
        );

        Ok(config)
    }

    pub fn validate(&self) -> GridCacheResult<()> {
        if self.slow_operation_threshold.is_zero() {
            return Err(GridCacheError::configuration(
                "executor.slow_operation_threshold",
                "threshold must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> GridCacheResult<Self> {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("GRIDCACHE_LOG_LEVEL") {
            config.level = level.to_lowercase();
        }

        if let Ok(value) = std::env::var("GRIDCACHE_LOG_ANSI") {
            config.ansi = parse_bool("GRIDCACHE_LOG_ANSI", &value)?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> GridCacheResult<()> {
        if !LOG_LEVELS.contains(&self.level.as_str()) {
            return Err(GridCacheError::configuration(
                "logging.level",
                format!(
                    "unknown level '{}', expected one of {}",
                    self.level,
                    LOG_LEVELS.join(", ")
                ),
            ));
        }
        Ok(())
    }
}

/// Builder for ClientConfig
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.config.executor = executor;
        self
    }

    pub fn preflight_reachability_check(mut self, enabled: bool) -> Self {
        self.config.executor.preflight_reachability_check = enabled;
        self
    }

    pub fn slow_operation_threshold(mut self, threshold: Duration) -> Self {
        self.config.executor.slow_operation_threshold = threshold;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    pub fn build(self) -> GridCacheResult<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(key: &str, value: &str) -> GridCacheResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GridCacheError::configuration(
            key,
            format!("expected a boolean, got '{}'", other),
        )),
    }
}

pub(crate) fn parse_duration_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
