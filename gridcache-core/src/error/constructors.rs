//! Constructor methods for GridCacheError

use super::types::GridCacheError;

impl GridCacheError {
    /// Create an invalid-state error for `operation`
    ///
    /// # Examples
    /// ```rust
    /// use gridcache_core::error::GridCacheError;
    ///
    /// let err = GridCacheError::invalid_state("complete", "already completed");
    /// assert!(err.to_string().contains("complete"));
    /// ```
    pub fn invalid_state(operation: impl Into<String>, state: impl Into<String>) -> Self {
        GridCacheError::InvalidState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    /// Create a configuration error with component and message
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        GridCacheError::ConfigurationError {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn logging_init(message: impl Into<String>) -> Self {
        GridCacheError::LoggingInit {
            message: message.into(),
        }
    }

    /// True for errors caused by a second settle of an already terminal future
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, GridCacheError::InvalidState { .. })
    }
}
