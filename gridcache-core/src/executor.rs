//! Entry processor execution
//!
//! [`EntryProcessorExecutor::submit`] runs a caller-supplied processor once
//! against one key on the node that owns it and returns a [`CacheFuture`]
//! for the result. Each invocation moves through
//!
//! ```text
//! Submitted ─┬─▶ Committed(R)
//!            ├─▶ UserFailed      (processor raised)
//!            ├─▶ Disconnected    (owner unreachable / link lost)
//!            └─▶ Cancelled       (caller cancelled before commit)
//! ```
//!
//! and never leaves a terminal state. `Disconnected` operations are not
//! retried; the failure carries the reconnect future of the current outage
//! so the caller can wait for it and resubmit.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, debug_span, warn, Instrument};

use crate::config::{ClientConfig, ExecutorConfig, DEFAULT_CLIENT_NAME};
use crate::connection::{ConnectionStatus, ConnectionTracker};
use crate::error::{FailureKind, GridCacheError, GridCacheResult, OperationFailure};
use crate::future::{panic_message, CacheFuture, FutureState};
use crate::processor::{EntryMutationRequest, EntryProcessor, ProcessorError};
use crate::router::{CommitGate, EntryRouter, RemoteFailure};

/// Per-invocation lifecycle, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Submitted,
    Committed,
    UserFailed,
    Disconnected,
    Cancelled,
}

impl InvocationState {
    fn after_failure(failure: &OperationFailure) -> Self {
        match failure.kind() {
            FailureKind::UserCode => InvocationState::UserFailed,
            FailureKind::Cancelled => InvocationState::Cancelled,
            FailureKind::Disconnected => InvocationState::Disconnected,
        }
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationState::Submitted => write!(f, "submitted"),
            InvocationState::Committed => write!(f, "committed"),
            InvocationState::UserFailed => write!(f, "user-failed"),
            InvocationState::Disconnected => write!(f, "disconnected"),
            InvocationState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Wrap a routing/storage failure into the caller-facing taxonomy
pub fn into_operation_failure(failure: RemoteFailure, tracker: &ConnectionTracker) -> OperationFailure {
    match failure {
        RemoteFailure::Processor(err) => err.into_failure(),
        RemoteFailure::Unreachable { .. } | RemoteFailure::LinkLost { .. } => {
            tracker.disconnected_failure(failure.to_string(), None)
        }
        RemoteFailure::Aborted => OperationFailure::cancelled(failure.to_string()),
    }
}

/// Submits entry mutation requests to their owning nodes
pub struct EntryProcessorExecutor<K, V, S> {
    router: Arc<S>,
    tracker: Arc<ConnectionTracker>,
    config: ExecutorConfig,
    client_name: Arc<str>,
    runtime: Handle,
    _entries: PhantomData<fn(K, V)>,
}

impl<K, V, S> Clone for EntryProcessorExecutor<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
            tracker: Arc::clone(&self.tracker),
            config: self.config.clone(),
            client_name: Arc::clone(&self.client_name),
            runtime: self.runtime.clone(),
            _entries: PhantomData,
        }
    }
}

impl<K, V, S> EntryProcessorExecutor<K, V, S>
where
    K: Clone + fmt::Debug + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: EntryRouter<K, V>,
{
    /// Create an executor on the current tokio runtime with default settings
    ///
    /// # Errors
    /// Returns an error when called outside a tokio runtime.
    pub fn new(router: Arc<S>, tracker: Arc<ConnectionTracker>) -> GridCacheResult<Self> {
        Self::with_config(router, tracker, ExecutorConfig::default())
    }

    /// Create an executor on the current tokio runtime
    pub fn with_config(
        router: Arc<S>,
        tracker: Arc<ConnectionTracker>,
        config: ExecutorConfig,
    ) -> GridCacheResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            GridCacheError::configuration("executor.runtime", format!("no tokio runtime: {}", e))
        })?;
        Ok(Self::with_runtime(router, tracker, config, runtime))
    }

    /// Create an executor on the current tokio runtime from a full client
    /// configuration; `client_name` tags every invocation's log span
    pub fn from_client_config(
        router: Arc<S>,
        tracker: Arc<ConnectionTracker>,
        config: &ClientConfig,
    ) -> GridCacheResult<Self> {
        config.validate()?;
        let executor = Self::with_config(router, tracker, config.executor.clone())?;
        Ok(executor.named(config.client_name.as_str()))
    }

    /// Create an executor that spawns onto `runtime`
    pub fn with_runtime(
        router: Arc<S>,
        tracker: Arc<ConnectionTracker>,
        config: ExecutorConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            router,
            tracker,
            config,
            client_name: Arc::from(DEFAULT_CLIENT_NAME),
            runtime,
            _entries: PhantomData,
        }
    }

    /// Replace the client name reported in logs
    pub fn named(mut self, client_name: impl Into<Arc<str>>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn router(&self) -> &Arc<S> {
        &self.router
    }

    /// Reconnect future of the current outage, or completed `true` if attached
    pub fn current_reconnect_future(&self) -> CacheFuture<bool> {
        self.tracker.current_reconnect_future()
    }

    /// Run `request` against its key on the owning node
    ///
    /// Returns immediately. Cancelling the returned future before the owner
    /// commits aborts the execution and leaves the entry untouched; once the
    /// owner has committed, cancellation has no effect and the future reports
    /// the committed result. The same holds when the link to the cluster
    /// drops while the request is in flight: the future fails with
    /// `Disconnected` unless the owner had already begun committing. A
    /// processor that panics fails the future with `UserCode`.
    pub fn submit<A, R>(&self, request: EntryMutationRequest<K, V, A, R>) -> CacheFuture<R>
    where
        A: Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let future = CacheFuture::new();
        let span = debug_span!(
            "entry_processor",
            client = %self.client_name,
            key = ?request.key
        );
        let entered = span.enter();
        debug!(state = %InvocationState::Submitted, "Entry processor invocation");

        if let Some(failure) = self.preflight(&request.key) {
            debug!(
                state = %InvocationState::Disconnected,
                "Entry processor rejected before routing"
            );
            let _ = future.fail(failure);
            return future;
        }

        let gate = CommitGate::for_future(&future);
        let router = Arc::clone(&self.router);
        let tracker = Arc::clone(&self.tracker);
        let slow_threshold = self.config.slow_operation_threshold;
        let handle = future.clone();

        let task = async move {
            let started = Instant::now();
            let EntryMutationRequest {
                key,
                processor,
                arg,
            } = request;

            let routed = AssertUnwindSafe(router.route_and_execute(key, processor, arg, gate))
                .catch_unwind()
                .map(|result| result.unwrap_or_else(|panic| Err(panicked(&*panic))));
            tokio::pin!(routed);
            let link_lost = link_lost(&tracker);
            tokio::pin!(link_lost);
            let mut watch_link = true;

            let state = loop {
                tokio::select! {
                    biased;
                    _ = handle.cancelled() => break InvocationState::Cancelled,
                    _ = &mut link_lost, if watch_link => {
                        let failure = tracker.disconnected_failure(
                            "link to the cluster lost while the request was in flight",
                            None,
                        );
                        if handle.fail_unless_committing(failure) {
                            break InvocationState::Disconnected;
                        }
                        // already committing or cancelled: let the owner finish
                        watch_link = false;
                    }
                    result = &mut routed => break settle(&handle, result, &tracker),
                }
            };

            let elapsed = started.elapsed();
            if elapsed > slow_threshold {
                warn!(state = %state, elapsed = ?elapsed, "Slow entry processor invocation");
            } else {
                debug!(state = %state, elapsed = ?elapsed, "Entry processor invocation finished");
            }
        };
        drop(entered);
        self.runtime.spawn(task.instrument(span));

        future
    }

    /// Run the same processor against each key
    ///
    /// The aggregate future completes with a per-key result once every key
    /// has finished. Cancelling the aggregate cancels every per-key
    /// invocation that has not committed yet.
    pub fn submit_all<A, R, I>(
        &self,
        keys: I,
        processor: Arc<dyn EntryProcessor<K, V, A, R>>,
        arg: A,
    ) -> CacheFuture<HashMap<K, Result<R, OperationFailure>>>
    where
        I: IntoIterator<Item = K>,
        A: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let children: Vec<(K, CacheFuture<R>)> = keys
            .into_iter()
            .map(|key| {
                let request =
                    EntryMutationRequest::from_arc(key.clone(), Arc::clone(&processor), arg.clone());
                (key, self.submit(request))
            })
            .collect();

        let aggregate = CacheFuture::new();

        let to_cancel: Vec<CacheFuture<R>> = children.iter().map(|(_, f)| f.clone()).collect();
        aggregate.on_complete(move |outcome| {
            if outcome.is_cancelled() {
                for child in &to_cancel {
                    child.cancel();
                }
            }
        });

        let handle = aggregate.clone();
        self.runtime.spawn(async move {
            let mut results = HashMap::with_capacity(children.len());
            for (key, child) in children {
                let result = child.wait().await;
                results.insert(key, result);
            }
            if let Ok(false) = handle.complete(results) {
                debug!("Aggregate entry processor result discarded after cancellation");
            }
        });

        aggregate
    }

    fn preflight(&self, key: &K) -> Option<OperationFailure> {
        if !self.tracker.is_attached() {
            return Some(self.tracker.disconnected_failure(
                format!("client is not attached to the cluster, key {:?} not routed", key),
                None,
            ));
        }
        if self.config.preflight_reachability_check && !self.router.is_reachable(key) {
            return Some(self.tracker.disconnected_failure(
                format!("owning node for key {:?} is unreachable", key),
                None,
            ));
        }
        None
    }
}

fn panicked(payload: &(dyn std::any::Any + Send)) -> RemoteFailure {
    RemoteFailure::Processor(ProcessorError::new(format!(
        "entry processor panicked: {}",
        panic_message(payload)
    )))
}

/// Resolves once the tracker leaves `Attached`
async fn link_lost(tracker: &ConnectionTracker) {
    let mut rx = tracker.subscribe();
    let lost = rx
        .wait_for(|status| *status != ConnectionStatus::Attached)
        .await
        .is_ok();
    if !lost {
        std::future::pending::<()>().await;
    }
}

fn settle<R>(
    future: &CacheFuture<R>,
    result: Result<R, RemoteFailure>,
    tracker: &ConnectionTracker,
) -> InvocationState {
    let (state, settled) = match result {
        Ok(value) => (InvocationState::Committed, future.complete(value)),
        Err(remote) => {
            let failure = into_operation_failure(remote, tracker);
            (InvocationState::after_failure(&failure), future.fail(failure))
        }
    };

    match settled {
        Ok(true) => state,
        Ok(false) => InvocationState::Cancelled,
        Err(e) => {
            // only this task settles the future besides cancel()
            warn!(error = %e, "Entry processor future settled twice");
            match future.state() {
                FutureState::Cancelled => InvocationState::Cancelled,
                _ => state,
            }
        }
    }
}
