//! Client-side core of the gridcache distributed cache
//!
//! Provides the cancellable [`CacheFuture`] every operation returns, the
//! [`ConnectionTracker`] that turns link loss into reconnect futures, and the
//! [`EntryProcessorExecutor`] that runs caller logic next to an entry on its
//! owning node.

pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod future;
pub mod local_store;
pub mod logging;
pub mod processor;
pub mod router;

pub use config::ClientConfig;
pub use connection::{ConnectionStatus, ConnectionTracker};
pub use error::{FailureKind, GridCacheError, GridCacheResult, OperationFailure};
pub use executor::EntryProcessorExecutor;
pub use future::{CacheFuture, FutureState, Outcome};
pub use local_store::LocalEntryStore;
pub use processor::{
    EntryEffect, EntryMutationRequest, EntryProcessor, IncrementProcessor, MutableEntry,
    ProcessorError,
};
pub use router::{CommitGate, EntryRouter, RemoteFailure};
