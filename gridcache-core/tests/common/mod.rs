// Common test utilities and helpers for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gridcache_core::{
    ConnectionTracker, EntryProcessor, EntryProcessorExecutor, IncrementProcessor,
    LocalEntryStore,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub type CounterStore = LocalEntryStore<String, i64>;
pub type CounterExecutor = EntryProcessorExecutor<String, i64, CounterStore>;

/// Store, tracker and executor wired together on the current runtime
pub struct Harness {
    pub store: Arc<CounterStore>,
    pub tracker: Arc<ConnectionTracker>,
    pub executor: CounterExecutor,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(LocalEntryStore::new());
        let tracker = Arc::new(ConnectionTracker::new());
        let executor = EntryProcessorExecutor::new(Arc::clone(&store), Arc::clone(&tracker))
            .expect("tests run inside a tokio runtime");
        Self {
            store,
            tracker,
            executor,
        }
    }
}

pub fn key(name: &str) -> String {
    name.to_string()
}

pub fn increment() -> Arc<dyn EntryProcessor<String, i64, i64, i64>> {
    Arc::new(IncrementProcessor)
}

/// Wait for a condition with timeout
pub async fn wait_for_condition<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
