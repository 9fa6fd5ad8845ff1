//! Cancellable, single-assignment futures
//!
//! A [`CacheFuture`] is the handle every gridcache operation returns. It is a
//! shared result cell with four states:
//!
//! ```text
//!              complete(v)
//!          ┌──────────────────▶ Completed(v)
//!          │   fail(e)
//! Pending ─┼──────────────────▶ Failed(e)
//!          │   cancel()
//!          └──────────────────▶ Cancelled
//! ```
//!
//! Exactly one transition out of `Pending` ever happens. The transition is a
//! compare-and-set performed under a short `parking_lot` critical section that
//! never awaits or calls user code. When cancellation races with natural
//! completion, whichever reaches the cell first wins and the loser is
//! discarded without an error.
//!
//! Handles are cheap to clone; clones observe the same cell.

use std::any::Any;
use std::fmt;
use std::future::IntoFuture;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{GridCacheError, GridCacheResult, OperationFailure};

/// Snapshot of a future's state without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureState {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl FutureState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FutureState::Pending)
    }
}

impl fmt::Display for FutureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutureState::Pending => write!(f, "pending"),
            FutureState::Completed => write!(f, "completed"),
            FutureState::Failed => write!(f, "failed"),
            FutureState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal state of a future, with its payload
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Completed(T),
    Failed(OperationFailure),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn state(&self) -> FutureState {
        match self {
            Outcome::Completed(_) => FutureState::Completed,
            Outcome::Failed(_) => FutureState::Failed,
            Outcome::Cancelled => FutureState::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&OperationFailure> {
        match self {
            Outcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl<T: Clone> Outcome<T> {
    /// The value, or the failure `wait()` would raise
    pub fn to_result(&self) -> Result<T, OperationFailure> {
        match self {
            Outcome::Completed(value) => Ok(value.clone()),
            Outcome::Failed(failure) => Err(failure.clone()),
            Outcome::Cancelled => Err(OperationFailure::cancelled(
                "future was cancelled before completion",
            )),
        }
    }
}

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

struct Cell<T> {
    outcome: Option<Arc<Outcome<T>>>,
    /// Set once the underlying operation is past its point of no return.
    committing: bool,
    callbacks: Vec<Callback<T>>,
    /// True while the settling thread is still delivering callbacks.
    draining: bool,
}

struct Inner<T> {
    cell: Mutex<Cell<T>>,
    terminal: watch::Sender<Option<FutureState>>,
}

enum Rejection {
    Terminal(FutureState),
    Committing,
}

impl<T> Inner<T> {
    fn new() -> Self {
        let (terminal, _) = watch::channel(None);
        Self {
            cell: Mutex::new(Cell {
                outcome: None,
                committing: false,
                callbacks: Vec::new(),
                draining: false,
            }),
            terminal,
        }
    }

    fn settle(&self, outcome: Outcome<T>) -> Result<(), Rejection> {
        let yields_to_commit = outcome.state() == FutureState::Cancelled;
        self.settle_unless(outcome, yields_to_commit)
    }

    /// Settle with `outcome`; with `yields_to_commit` the transition is
    /// refused once the operation has begun committing.
    fn settle_unless(&self, outcome: Outcome<T>, yields_to_commit: bool) -> Result<(), Rejection> {
        let state = outcome.state();
        let outcome = Arc::new(outcome);
        {
            let mut cell = self.cell.lock();
            if let Some(existing) = &cell.outcome {
                return Err(Rejection::Terminal(existing.state()));
            }
            if cell.committing && yields_to_commit {
                return Err(Rejection::Committing);
            }
            cell.outcome = Some(Arc::clone(&outcome));
            cell.draining = true;
        }

        self.terminal.send_replace(Some(state));
        self.drain_callbacks(&outcome);
        Ok(())
    }

    /// Runs queued callbacks in registration order, outside the lock.
    /// Callbacks registered while draining are picked up by the next round.
    /// A panicking callback is logged and does not stop the others.
    fn drain_callbacks(&self, outcome: &Outcome<T>) {
        loop {
            let batch = {
                let mut cell = self.cell.lock();
                if cell.callbacks.is_empty() {
                    cell.draining = false;
                    return;
                }
                std::mem::take(&mut cell.callbacks)
            };
            for callback in batch {
                run_callback(callback, outcome);
            }
        }
    }

    fn begin_commit(&self) -> bool {
        let mut cell = self.cell.lock();
        if cell.outcome.is_some() {
            return false;
        }
        cell.committing = true;
        true
    }

    fn state(&self) -> FutureState {
        self.cell
            .lock()
            .outcome
            .as_ref()
            .map_or(FutureState::Pending, |outcome| outcome.state())
    }
}

fn run_callback<T>(callback: Callback<T>, outcome: &Outcome<T>) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
        warn!(
            state = %outcome.state(),
            panic = %panic_message(&*panic),
            "Completion callback panicked"
        );
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    }
}

/// Commit hook the owning side of an operation uses to close the
/// cancellation window. Type-erased so routers need not know `T`.
pub(crate) trait CommitSignal: Send + Sync {
    fn begin_commit(&self) -> bool;
    fn is_cancelled(&self) -> bool;
}

impl<T: Send + Sync> CommitSignal for Inner<T> {
    fn begin_commit(&self) -> bool {
        Inner::begin_commit(self)
    }

    fn is_cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }
}

/// Handle to the eventual result of an asynchronous gridcache operation
pub struct CacheFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CacheFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CacheFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CacheFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFuture")
            .field("state", &self.state())
            .finish()
    }
}

impl<T> CacheFuture<T> {
    /// Create a new pending future
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Create a future that is already completed with `value`
    pub fn completed(value: T) -> Self {
        let future = Self::new();
        let _ = future.inner.settle(Outcome::Completed(value));
        future
    }

    /// Create a future that has already failed with `failure`
    pub fn failed(failure: OperationFailure) -> Self {
        let future = Self::new();
        let _ = future.inner.settle(Outcome::Failed(failure));
        future
    }

    /// True if both handles observe the same result cell
    pub fn same_instance(a: &CacheFuture<T>, b: &CacheFuture<T>) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Complete the future with `value`
    ///
    /// Returns `Ok(true)` if this call settled the future and `Ok(false)` if
    /// the future had already been cancelled, in which case `value` is
    /// dropped. Completing a future that already completed or failed is a
    /// bug in the caller and yields [`GridCacheError::InvalidState`].
    pub fn complete(&self, value: T) -> GridCacheResult<bool> {
        self.resolve("complete", Outcome::Completed(value))
    }

    /// Fail the future with `failure`; same contract as [`complete`](Self::complete)
    pub fn fail(&self, failure: OperationFailure) -> GridCacheResult<bool> {
        self.resolve("fail", Outcome::Failed(failure))
    }

    fn resolve(&self, operation: &str, outcome: Outcome<T>) -> GridCacheResult<bool> {
        match self.inner.settle(outcome) {
            Ok(()) => Ok(true),
            Err(Rejection::Terminal(FutureState::Cancelled)) => {
                debug!(operation, "Discarding result of a cancelled future");
                Ok(false)
            }
            Err(Rejection::Terminal(state)) => Err(GridCacheError::invalid_state(
                operation,
                format!("future already {}", state),
            )),
            Err(Rejection::Committing) => Ok(false),
        }
    }

    /// Request cancellation
    ///
    /// Returns `true` if the future moved to `Cancelled`. Returns `false` if
    /// it was already terminal, or if the underlying operation had already
    /// begun committing; in both cases the future's eventual state is left
    /// untouched.
    pub fn cancel(&self) -> bool {
        match self.inner.settle(Outcome::Cancelled) {
            Ok(()) => true,
            Err(Rejection::Terminal(_)) => false,
            Err(Rejection::Committing) => {
                debug!("Cancellation ineffective, operation already committing");
                false
            }
        }
    }

    /// Fail the future unless the underlying operation has begun committing
    ///
    /// Used when the operation is abandoned from the outside (the link
    /// dropped while it was in flight). Returns `true` if this call settled
    /// the future.
    pub(crate) fn fail_unless_committing(&self, failure: OperationFailure) -> bool {
        self.inner
            .settle_unless(Outcome::Failed(failure), true)
            .is_ok()
    }

    /// Mark the underlying operation as past its point of no return
    ///
    /// Returns `false` if the future is already terminal (typically because
    /// it was cancelled), in which case the operation must not commit.
    pub(crate) fn begin_commit(&self) -> bool {
        self.inner.begin_commit()
    }

    pub(crate) fn commit_signal(&self) -> Arc<dyn CommitSignal>
    where
        T: Send + Sync + 'static,
    {
        self.inner.clone()
    }

    pub fn state(&self) -> FutureState {
        self.inner.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// Register a callback invoked exactly once with the terminal outcome
    ///
    /// If the future is already terminal the callback runs immediately on
    /// the calling thread. Otherwise it runs on the thread that settles the
    /// future, after every callback registered before it.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let ready = {
            let mut guard = self.inner.cell.lock();
            let cell = &mut *guard;
            match (&cell.outcome, cell.draining) {
                (Some(outcome), false) => Arc::clone(outcome),
                _ => {
                    cell.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        run_callback(Box::new(callback), &ready);
    }

    /// Resolves once the future has been cancelled
    ///
    /// Never resolves if the future completes or fails instead. Intended for
    /// `select!`-ing an in-flight operation against its cancellation.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.terminal.subscribe();
        let cancelled = rx
            .wait_for(|state| *state == Some(FutureState::Cancelled))
            .await
            .is_ok();
        if !cancelled {
            std::future::pending::<()>().await;
        }
    }
}

impl<T: Clone> CacheFuture<T> {
    /// Non-blocking peek at the terminal outcome
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        self.inner
            .cell
            .lock()
            .outcome
            .as_ref()
            .map(|outcome| outcome.as_ref().clone())
    }

    /// Suspend until the future is terminal and return its value or failure
    ///
    /// A cancelled future yields [`OperationFailure::Cancelled`].
    pub async fn wait(&self) -> Result<T, OperationFailure> {
        let mut rx = self.inner.terminal.subscribe();
        loop {
            if let Some(outcome) = self.try_outcome() {
                return outcome.to_result();
            }
            if rx.changed().await.is_err() {
                return Err(OperationFailure::cancelled(
                    "future was abandoned before completion",
                ));
            }
        }
    }
}

impl<T> IntoFuture for CacheFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, OperationFailure>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}
