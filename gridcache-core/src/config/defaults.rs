//! Default configuration values for gridcache
//!
//! Every `Default` impl in `config` reads its values from here.

use std::time::Duration;

// Client defaults
pub const DEFAULT_CLIENT_NAME: &str = "gridcache-client";

// Executor defaults
pub const DEFAULT_PREFLIGHT_REACHABILITY_CHECK: bool = true;
pub const DEFAULT_SLOW_OPERATION_THRESHOLD_MS: u64 = 500;

// Logging defaults
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_ANSI: bool = true;

/// Accepted values for `logging.level`
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Helper to create Duration from milliseconds
pub fn duration_millis(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
