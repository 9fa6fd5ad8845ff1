//! In-process entry store implementing [`EntryRouter`]
//!
//! `LocalEntryStore` owns every key itself, which makes it the owning node
//! for all requests. It serializes processors per key with one async mutex
//! per entry and applies each effect only after the commit gate admits it.
//! Reachability switches and link-loss injection let callers exercise the
//! disconnect paths without a network.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

use crate::processor::{EntryEffect, EntryProcessor, MutableEntry};
use crate::router::{CommitGate, EntryRouter, RemoteFailure};

type Slot<V> = Arc<Mutex<Option<V>>>;

/// Single-node entry store
pub struct LocalEntryStore<K, V> {
    slots: DashMap<K, Slot<V>>,
    reachable: AtomicBool,
    unreachable_keys: DashSet<K>,
    link_loss_pending: AtomicBool,
    execution_delay: RwLock<Option<Duration>>,
    commits: AtomicU64,
}

impl<K, V> fmt::Debug for LocalEntryStore<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEntryStore")
            .field("slots", &self.slots.len())
            .field("reachable", &self.reachable.load(Ordering::Acquire))
            .field("commits", &self.commits.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> Default for LocalEntryStore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LocalEntryStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            reachable: AtomicBool::new(true),
            unreachable_keys: DashSet::new(),
            link_loss_pending: AtomicBool::new(false),
            execution_delay: RwLock::new(None),
            commits: AtomicU64::new(0),
        }
    }

    fn slot(&self, key: &K) -> Slot<V> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.slots.entry(key.clone()).or_default().value())
    }

    /// Store `value` under `key`, waiting for any in-flight processor
    pub async fn put(&self, key: K, value: V) {
        let slot = self.slot(&key);
        *slot.lock().await = Some(value);
    }

    /// Remove `key`, returning the previous value
    pub async fn remove(&self, key: &K) -> Option<V> {
        let slot = self.slots.get(key).map(|slot| Arc::clone(slot.value()))?;
        let previous = slot.lock().await.take();
        drop(slot);
        self.evict_if_vacant(key);
        previous
    }

    /// Drop the slot of `key` if it is empty and no request holds it
    fn evict_if_vacant(&self, key: &K) {
        self.slots.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().map_or(false, |value| value.is_none())
        });
    }

    /// Number of keys with a slot, including slots in use by a request
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of keys currently holding a value
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().try_lock().map_or(true, |value| value.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of processor effects committed so far
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Make the whole node reachable or unreachable
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    pub fn mark_unreachable(&self, key: K) {
        self.unreachable_keys.insert(key);
    }

    pub fn mark_reachable(&self, key: &K) {
        self.unreachable_keys.remove(key);
    }

    /// The next routed request fails as if the link dropped mid-request
    pub fn fail_next_with_link_loss(&self) {
        self.link_loss_pending.store(true, Ordering::Release);
    }

    /// Hold every execution for `delay` between computing and committing
    pub fn set_execution_delay(&self, delay: Option<Duration>) {
        *self.execution_delay.write() = delay;
    }
}

impl<K, V> LocalEntryStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Read the committed value of `key`
    ///
    /// Waits for any processor running on `key`, so it never observes a
    /// half-applied mutation.
    pub async fn get(&self, key: &K) -> Option<V> {
        let slot = self.slots.get(key).map(|slot| Arc::clone(slot.value()))?;
        let value = slot.lock().await.clone();
        value
    }
}

#[async_trait]
impl<K, V> EntryRouter<K, V> for LocalEntryStore<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn route_and_execute<A, R>(
        &self,
        key: K,
        processor: Arc<dyn EntryProcessor<K, V, A, R>>,
        arg: A,
        gate: CommitGate,
    ) -> Result<R, RemoteFailure>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
    {
        if !self.is_reachable(&key) {
            return Err(RemoteFailure::Unreachable {
                key: format!("{:?}", key),
            });
        }
        if self.link_loss_pending.swap(false, Ordering::AcqRel) {
            return Err(RemoteFailure::LinkLost {
                reason: "connection reset while executing entry processor".to_string(),
            });
        }

        let slot = self.slot(&key);
        let mut stored = slot.lock().await;
        if gate.is_cancelled() {
            return Err(RemoteFailure::Aborted);
        }

        let mut entry = MutableEntry::new(key.clone(), stored.clone());
        let result = processor.process(&mut entry, &arg)?;

        let delay = *self.execution_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !gate.try_commit() {
            debug!(key = ?entry.key(), "Discarding entry effect, caller cancelled");
            return Err(RemoteFailure::Aborted);
        }

        let vacated = match entry.into_effect() {
            EntryEffect::Unchanged => false,
            EntryEffect::Set(value) => {
                *stored = Some(value);
                false
            }
            EntryEffect::Remove => {
                *stored = None;
                true
            }
        };
        self.commits.fetch_add(1, Ordering::Relaxed);

        if vacated {
            drop(stored);
            drop(slot);
            self.evict_if_vacant(&key);
        }
        Ok(result)
    }

    fn is_reachable(&self, key: &K) -> bool {
        self.reachable.load(Ordering::Acquire) && !self.unreachable_keys.contains(key)
    }
}
