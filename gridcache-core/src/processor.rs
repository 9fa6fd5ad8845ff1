//! Entry processors: caller logic executed next to a single cached entry
//!
//! An [`EntryProcessor`] receives a [`MutableEntry`] view of one key and an
//! argument, may read, replace or remove the value, and returns a result. The
//! owning side runs it exactly once against a consistent snapshot and commits
//! the resulting [`EntryEffect`] atomically with the computation.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::OperationFailure;

/// Error raised by an entry processor
///
/// Surfaces to the caller as [`OperationFailure::UserCode`].
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ProcessorError {
    message: String,
    #[source]
    cause: Option<Box<OperationFailure>>,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: OperationFailure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&OperationFailure> {
        self.cause.as_deref()
    }

    /// Wrap into the caller-facing `UserCode` failure, keeping the cause
    pub fn into_failure(self) -> OperationFailure {
        let failure = OperationFailure::user_code(self.message);
        match self.cause {
            Some(cause) => failure.with_cause(*cause),
            None => failure,
        }
    }
}

impl From<String> for ProcessorError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProcessorError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// What the owning side must apply after a processor returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryEffect<V> {
    Unchanged,
    Set(V),
    Remove,
}

/// Mutable view of one cache entry handed to an entry processor
pub struct MutableEntry<K, V> {
    key: K,
    value: Option<V>,
    modified: bool,
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for MutableEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableEntry")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("modified", &self.modified)
            .finish()
    }
}

impl<K, V> MutableEntry<K, V> {
    /// View over `key`, with `value` as the snapshot (`None` when absent)
    pub fn new(key: K, value: Option<V>) -> Self {
        Self {
            key,
            value,
            modified: false,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn set(&mut self, value: V) {
        self.value = Some(value);
        self.modified = true;
    }

    pub fn remove(&mut self) {
        self.value = None;
        self.modified = true;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn into_effect(self) -> EntryEffect<V> {
        match (self.modified, self.value) {
            (false, _) => EntryEffect::Unchanged,
            (true, Some(value)) => EntryEffect::Set(value),
            (true, None) => EntryEffect::Remove,
        }
    }
}

/// Caller-supplied logic run against one entry at its owning location
pub trait EntryProcessor<K, V, A, R>: Send + Sync {
    fn process(&self, entry: &mut MutableEntry<K, V>, arg: &A) -> Result<R, ProcessorError>;
}

impl<K, V, A, R, F> EntryProcessor<K, V, A, R> for F
where
    F: Fn(&mut MutableEntry<K, V>, &A) -> Result<R, ProcessorError> + Send + Sync,
{
    fn process(&self, entry: &mut MutableEntry<K, V>, arg: &A) -> Result<R, ProcessorError> {
        self(entry, arg)
    }
}

/// A request to run `processor` with `arg` against `key`
pub struct EntryMutationRequest<K, V, A, R> {
    pub key: K,
    pub processor: Arc<dyn EntryProcessor<K, V, A, R>>,
    pub arg: A,
}

impl<K, V, A, R> EntryMutationRequest<K, V, A, R> {
    pub fn new<P>(key: K, processor: P, arg: A) -> Self
    where
        P: EntryProcessor<K, V, A, R> + 'static,
    {
        Self {
            key,
            processor: Arc::new(processor),
            arg,
        }
    }

    /// Build a request from a closure
    ///
    /// ```rust
    /// use gridcache_core::processor::{EntryMutationRequest, ProcessorError};
    ///
    /// let request = EntryMutationRequest::from_fn("visits".to_string(), |entry, arg: &u64| {
    ///     let next = entry.get().copied().unwrap_or(0u64) + arg;
    ///     entry.set(next);
    ///     Ok::<_, ProcessorError>(next)
    /// }, 1);
    /// assert_eq!(request.key, "visits");
    /// ```
    pub fn from_fn<F>(key: K, processor: F, arg: A) -> Self
    where
        F: Fn(&mut MutableEntry<K, V>, &A) -> Result<R, ProcessorError> + Send + Sync + 'static,
    {
        Self::new(key, processor, arg)
    }

    /// Build a request sharing an existing processor
    pub fn from_arc(key: K, processor: Arc<dyn EntryProcessor<K, V, A, R>>, arg: A) -> Self {
        Self {
            key,
            processor,
            arg,
        }
    }
}

/// Adds the argument to an integer entry and returns the new value
///
/// An absent entry counts as zero. Overflow raises a processor error and
/// leaves the entry unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementProcessor;

impl<K: Send + Sync> EntryProcessor<K, i64, i64, i64> for IncrementProcessor {
    fn process(&self, entry: &mut MutableEntry<K, i64>, arg: &i64) -> Result<i64, ProcessorError> {
        let current = entry.get().copied().unwrap_or(0);
        let next = current
            .checked_add(*arg)
            .ok_or_else(|| ProcessorError::new(format!("increment of {current} by {arg} overflows")))?;
        entry.set(next);
        Ok(next)
    }
}
