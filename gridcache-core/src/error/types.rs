//! Call-site error types for gridcache
//!
//! `GridCacheError` is returned directly by the call that went wrong. It is
//! never stored in a future; see [`OperationFailure`](super::OperationFailure)
//! for the terminal failure of an asynchronous operation.

use thiserror::Error;

/// Errors raised synchronously by gridcache APIs
#[derive(Error, Debug)]
pub enum GridCacheError {
    /// A state transition was requested that the current state forbids,
    /// e.g. completing a future that already completed.
    #[error("Invalid state for '{operation}': {state}")]
    InvalidState { operation: String, state: String },

    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Failed to initialize logging: {message}")]
    LoggingInit { message: String },
}

pub type GridCacheResult<T> = std::result::Result<T, GridCacheError>;
