//! Error handling for the gridcache client
//!
//! Two families of errors live here and they never mix:
//!
//! - [`OperationFailure`] is the *only* thing an operation's future can fail
//!   with. It is a closed taxonomy (`UserCode`, `Cancelled`, `Disconnected`)
//!   so callers can match exhaustively and decide whether to wait for
//!   reconnection, resubmit, or give up.
//! - [`GridCacheError`] covers misuse and setup problems: settling a future
//!   twice, invalid configuration, logging initialisation. These are returned
//!   from the call that caused them and are never stored in a future.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    gridcache error families                  │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  OperationFailure (outcome)  │  GridCacheError (call site)   │
//! │  ┌────────────────────────┐  │  ┌─────────────────────────┐  │
//! │  │ • UserCode             │  │  │ • InvalidState          │  │
//! │  │ • Cancelled            │  │  │ • Configuration         │  │
//! │  │ • Disconnected (+task) │  │  │ • Io / Toml             │  │
//! │  └────────────────────────┘  │  │ • LoggingInit           │  │
//! │                              │  └─────────────────────────┘  │
//! └──────────────────────────────┴───────────────────────────────┘
//! ```

pub mod constructors;
pub mod failure;
pub mod types;

pub use failure::{FailureKind, OperationFailure};
pub use types::{GridCacheError, GridCacheResult};
