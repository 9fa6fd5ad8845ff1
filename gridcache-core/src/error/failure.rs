//! Terminal failure taxonomy for asynchronous operations
//!
//! An [`OperationFailure`] is what a [`CacheFuture`] fails with. The set of
//! kinds is closed:
//!
//! - **UserCode**: the caller-supplied entry processor raised an error
//! - **Cancelled**: the future was cancelled before it completed naturally
//! - **Disconnected**: the link to the cluster was lost; optionally carries
//!   the reconnect future of the disconnect episode that caused it
//!
//! Causes are owned by value, so a cause chain is always finite.

use std::fmt;

use thiserror::Error;

use crate::future::CacheFuture;

/// Discriminant of an [`OperationFailure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    UserCode,
    Cancelled,
    Disconnected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::UserCode => write!(f, "user-code"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Terminal failure of a gridcache operation
///
/// Callers receive this type and nothing else from a failed operation:
/// transport and storage errors are always wrapped into one of the three
/// variants. `Disconnected` is never downgraded to another kind, so a caller
/// can always tell "wait for the cluster" apart from "my code is broken".
#[derive(Error, Debug, Clone)]
pub enum OperationFailure {
    #[error("entry processor failed: {message}")]
    UserCode {
        message: String,
        #[source]
        cause: Option<Box<OperationFailure>>,
    },

    #[error("operation cancelled: {message}")]
    Cancelled {
        message: String,
        #[source]
        cause: Option<Box<OperationFailure>>,
    },

    #[error("client disconnected: {message}")]
    Disconnected {
        message: String,
        #[source]
        cause: Option<Box<OperationFailure>>,
        /// Shared with the connection tracker and every other failure raised
        /// during the same outage. `None` when raised outside an episode.
        reconnect: Option<CacheFuture<bool>>,
    },
}

impl OperationFailure {
    pub fn user_code(message: impl Into<String>) -> Self {
        OperationFailure::UserCode {
            message: message.into(),
            cause: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        OperationFailure::Cancelled {
            message: message.into(),
            cause: None,
        }
    }

    /// Disconnected failure without a reconnect future
    pub fn disconnected(message: impl Into<String>) -> Self {
        OperationFailure::Disconnected {
            message: message.into(),
            cause: None,
            reconnect: None,
        }
    }

    /// Disconnected failure bound to a disconnect episode
    pub fn disconnected_with_reconnect(
        message: impl Into<String>,
        reconnect: CacheFuture<bool>,
    ) -> Self {
        OperationFailure::Disconnected {
            message: message.into(),
            cause: None,
            reconnect: Some(reconnect),
        }
    }

    /// Attach `cause`, replacing any previous one
    pub fn with_cause(mut self, cause: OperationFailure) -> Self {
        match &mut self {
            OperationFailure::UserCode { cause: slot, .. }
            | OperationFailure::Cancelled { cause: slot, .. }
            | OperationFailure::Disconnected { cause: slot, .. } => {
                *slot = Some(Box::new(cause));
            }
        }
        self
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            OperationFailure::UserCode { .. } => FailureKind::UserCode,
            OperationFailure::Cancelled { .. } => FailureKind::Cancelled,
            OperationFailure::Disconnected { .. } => FailureKind::Disconnected,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            OperationFailure::UserCode { message, .. }
            | OperationFailure::Cancelled { message, .. }
            | OperationFailure::Disconnected { message, .. } => message,
        }
    }

    pub fn cause(&self) -> Option<&OperationFailure> {
        match self {
            OperationFailure::UserCode { cause, .. }
            | OperationFailure::Cancelled { cause, .. }
            | OperationFailure::Disconnected { cause, .. } => cause.as_deref(),
        }
    }

    /// Innermost failure of the cause chain (`self` when there is no cause)
    pub fn root_cause(&self) -> &OperationFailure {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next;
        }
        current
    }

    /// The reconnect future of the episode this failure belongs to
    pub fn reconnect_future(&self) -> Option<&CacheFuture<bool>> {
        match self {
            OperationFailure::Disconnected { reconnect, .. } => reconnect.as_ref(),
            _ => None,
        }
    }

    pub fn is_user_code(&self) -> bool {
        self.kind() == FailureKind::UserCode
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == FailureKind::Cancelled
    }

    pub fn is_disconnected(&self) -> bool {
        self.kind() == FailureKind::Disconnected
    }
}
