//! Seam to the routing/storage layer that owns cache entries
//!
//! The executor never touches entries itself. It hands each request to an
//! [`EntryRouter`], which sends it to the owning node, runs the processor
//! there and commits the effect. Implementations must serialize processors
//! per key and apply each effect atomically with the computation that
//! produced it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::future::{CacheFuture, CommitSignal};
use crate::processor::{EntryProcessor, ProcessorError};

/// Failure reported by the routing/storage layer
///
/// Never reaches callers directly; the executor wraps it into an
/// [`OperationFailure`](crate::error::OperationFailure).
#[derive(Error, Debug, Clone)]
pub enum RemoteFailure {
    #[error("entry processor raised: {0}")]
    Processor(#[from] ProcessorError),

    #[error("owning node for key {key} is unreachable")]
    Unreachable { key: String },

    #[error("link to owning node lost: {reason}")]
    LinkLost { reason: String },

    #[error("remote execution aborted before commit")]
    Aborted,
}

/// Lets the owning side close the cancellation window before committing
///
/// Call [`try_commit`](Self::try_commit) immediately before applying an
/// entry effect. `true` means cancellation can no longer win and the effect
/// must be applied; `false` means the caller already cancelled and the
/// effect must be discarded.
#[derive(Clone)]
pub struct CommitGate {
    signal: Option<Arc<dyn CommitSignal>>,
}

impl std::fmt::Debug for CommitGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitGate")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CommitGate {
    /// Gate tied to the caller's future
    pub fn for_future<R>(future: &CacheFuture<R>) -> Self
    where
        R: Send + Sync + 'static,
    {
        Self {
            signal: Some(future.commit_signal()),
        }
    }

    /// Gate that always admits the commit, for execution without a caller
    pub fn open() -> Self {
        Self { signal: None }
    }

    pub fn try_commit(&self) -> bool {
        self.signal
            .as_ref()
            .map_or(true, |signal| signal.begin_commit())
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal
            .as_ref()
            .is_some_and(|signal| signal.is_cancelled())
    }
}

/// Routing and execution collaborator
#[async_trait]
pub trait EntryRouter<K, V>: Send + Sync + 'static
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Run `processor` once against `key` on its owning node
    ///
    /// May suspend. Must either commit the processor's effect together with
    /// returning its result, or leave the entry untouched.
    async fn route_and_execute<A, R>(
        &self,
        key: K,
        processor: Arc<dyn EntryProcessor<K, V, A, R>>,
        arg: A,
        gate: CommitGate,
    ) -> Result<R, RemoteFailure>
    where
        A: Send + Sync + 'static,
        R: Send + 'static;

    /// Cheap pre-flight check that the owner of `key` can be reached
    fn is_reachable(&self, key: &K) -> bool;
}
