//! Client connection state tracking
//!
//! The [`ConnectionTracker`] records whether the client is attached to the
//! cluster. The network layer drives it with three signals:
//!
//! - `detected(reason)`: link lost, `Attached -> Detached`
//! - `reconnected()`: link restored, `Detached -> Attached`
//! - `reconnect_failed(error)`: a reconnect attempt failed, stay `Detached`
//!
//! Every disconnect opens one *episode* holding a reconnect future. All
//! [`OperationFailure::Disconnected`] values raised while the episode is open
//! carry that same future, so callers that failed at different moments all
//! synchronise on one reconnection outcome.
//!
//! The tracker is an ordinary value that can be created per test; a
//! process-wide instance is available through [`ConnectionTracker::global`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_CLIENT_NAME;
use crate::error::OperationFailure;
use crate::future::CacheFuture;

static GLOBAL_TRACKER: Lazy<Arc<ConnectionTracker>> =
    Lazy::new(|| Arc::new(ConnectionTracker::new()));

/// Externally visible connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Attached,
    Detached,
    /// The client was shut down; no further transitions happen.
    Stopped,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Attached => write!(f, "attached"),
            ConnectionStatus::Detached => write!(f, "detached"),
            ConnectionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// One disconnect-to-reconnect interval
struct Episode {
    started_at: Instant,
    reason: String,
    reconnect: CacheFuture<bool>,
    failed_attempts: u32,
}

impl Episode {
    fn open(reason: String) -> Self {
        Self {
            started_at: Instant::now(),
            reason,
            reconnect: CacheFuture::new(),
            failed_attempts: 0,
        }
    }
}

enum LinkState {
    Attached,
    Detached(Episode),
    Stopped,
}

impl LinkState {
    fn status(&self) -> ConnectionStatus {
        match self {
            LinkState::Attached => ConnectionStatus::Attached,
            LinkState::Detached(_) => ConnectionStatus::Detached,
            LinkState::Stopped => ConnectionStatus::Stopped,
        }
    }
}

/// Tracks attachment to the cluster and owns the active disconnect episode
pub struct ConnectionTracker {
    client: String,
    state: Mutex<LinkState>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("client", &self.client)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionTracker {
    /// Create a tracker in the `Attached` state
    pub fn new() -> Self {
        Self::named(DEFAULT_CLIENT_NAME)
    }

    /// Create a tracker whose transition logs carry `client`
    pub fn named(client: impl Into<String>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Attached);
        Self {
            client: client.into(),
            state: Mutex::new(LinkState::Attached),
            status_tx,
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client
    }

    /// Process-wide tracker shared by clients that do not supply their own
    pub fn global() -> Arc<ConnectionTracker> {
        Arc::clone(&GLOBAL_TRACKER)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status()
    }

    pub fn is_attached(&self) -> bool {
        self.status() == ConnectionStatus::Attached
    }

    /// Receive every status transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// When the active episode started, if the client is detached
    pub fn episode_started_at(&self) -> Option<Instant> {
        match &*self.state.lock() {
            LinkState::Detached(episode) => Some(episode.started_at),
            _ => None,
        }
    }

    /// Number of failed reconnect attempts in the active episode
    pub fn failed_reconnect_attempts(&self) -> u32 {
        match &*self.state.lock() {
            LinkState::Detached(episode) => episode.failed_attempts,
            _ => 0,
        }
    }

    /// The network layer lost the link to the cluster
    ///
    /// Opens a new episode when attached. When already detached the existing
    /// episode is kept. Returns the episode's reconnect future.
    pub fn detected(&self, reason: impl Into<String>) -> CacheFuture<bool> {
        let reason = reason.into();
        let mut state = self.state.lock();
        match &*state {
            LinkState::Detached(episode) => {
                debug!(
                    client = %self.client,
                    reason = %reason,
                    original = %episode.reason,
                    "Disconnect already detected, keeping current episode"
                );
                episode.reconnect.clone()
            }
            LinkState::Stopped => {
                debug!(
                    client = %self.client,
                    reason = %reason,
                    "Ignoring disconnect signal on stopped client"
                );
                stopped_future()
            }
            LinkState::Attached => {
                let episode = Episode::open(reason);
                let reconnect = episode.reconnect.clone();
                warn!(
                    client = %self.client,
                    reason = %episode.reason,
                    "Client disconnected from cluster"
                );
                *state = LinkState::Detached(episode);
                self.status_tx.send_replace(ConnectionStatus::Detached);
                reconnect
            }
        }
    }

    /// The network layer restored the link
    ///
    /// Completes the episode's future with `true` and closes the episode.
    /// A duplicate signal while attached is ignored. Returns whether a
    /// transition happened.
    pub fn reconnected(&self) -> bool {
        let episode = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, LinkState::Attached) {
                LinkState::Detached(episode) => {
                    self.status_tx.send_replace(ConnectionStatus::Attached);
                    episode
                }
                other => {
                    *state = other;
                    debug!(status = %state.status(), "Ignoring spurious reconnect signal");
                    return false;
                }
            }
        };

        info!(
            client = %self.client,
            outage = ?episode.started_at.elapsed(),
            failed_attempts = episode.failed_attempts,
            "Client reconnected to cluster"
        );
        if let Err(e) = episode.reconnect.complete(true) {
            debug!(error = %e, "Reconnect future already settled by a failed attempt");
        }
        true
    }

    /// A reconnect attempt failed
    ///
    /// Fails the episode's future with `error`; the tracker stays detached
    /// and keeps the episode until a later `reconnected()` or `shutdown()`.
    pub fn reconnect_failed(&self, error: OperationFailure) -> bool {
        let reconnect = {
            let mut state = self.state.lock();
            match &mut *state {
                LinkState::Detached(episode) => {
                    episode.failed_attempts += 1;
                    warn!(
                        client = %self.client,
                        attempts = episode.failed_attempts,
                        error = %error,
                        "Client reconnect attempt failed"
                    );
                    episode.reconnect.clone()
                }
                other => {
                    debug!(status = %other.status(), "Ignoring reconnect failure signal");
                    return false;
                }
            }
        };

        match reconnect.fail(error) {
            Ok(applied) => applied,
            Err(e) => {
                debug!(error = %e, "Reconnect future already failed in this episode");
                false
            }
        }
    }

    /// Reconnect future of the active episode, or a future already completed
    /// with `true` while attached
    pub fn current_reconnect_future(&self) -> CacheFuture<bool> {
        match &*self.state.lock() {
            LinkState::Attached => CacheFuture::completed(true),
            LinkState::Detached(episode) => episode.reconnect.clone(),
            LinkState::Stopped => stopped_future(),
        }
    }

    /// Build a `Disconnected` failure bound to the active episode
    ///
    /// Outside an episode the failure carries no reconnect future.
    pub fn disconnected_failure(
        &self,
        message: impl Into<String>,
        cause: Option<OperationFailure>,
    ) -> OperationFailure {
        let failure = match &*self.state.lock() {
            LinkState::Detached(episode) => {
                OperationFailure::disconnected_with_reconnect(message, episode.reconnect.clone())
            }
            _ => OperationFailure::disconnected(message),
        };
        match cause {
            Some(cause) => failure.with_cause(cause),
            None => failure,
        }
    }

    /// Stop tracking; any pending reconnect future fails with `Disconnected`
    pub fn shutdown(&self) {
        let previous = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut *state, LinkState::Stopped);
            self.status_tx.send_replace(ConnectionStatus::Stopped);
            previous
        };

        if let LinkState::Detached(episode) = previous {
            let _ = episode
                .reconnect
                .fail(OperationFailure::disconnected("client stopped while disconnected"));
        }
        info!(client = %self.client, "Connection tracker stopped");
    }

    /// Wait until the tracker reports `status`, or `timeout` elapses
    pub async fn wait_for_status(&self, status: ConnectionStatus, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|current| *current == status))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }
}

fn stopped_future() -> CacheFuture<bool> {
    CacheFuture::failed(OperationFailure::disconnected("client is stopped"))
}
