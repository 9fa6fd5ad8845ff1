// Entry processor executor integration tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{increment, key, Harness, TEST_TIMEOUT};
use gridcache_core::config::ExecutorConfig;
use gridcache_core::{
    CacheFuture, CommitGate, ConnectionTracker, EntryMutationRequest, EntryProcessor,
    EntryProcessorExecutor, EntryRouter, FutureState, GridCacheError, LocalEntryStore,
    MutableEntry, ProcessorError, RemoteFailure,
};

fn add(name: &str, delta: i64) -> EntryMutationRequest<String, i64, i64, i64> {
    EntryMutationRequest::from_arc(key(name), increment(), delta)
}

#[tokio::test]
async fn test_submit_commits_and_returns_result() {
    let h = Harness::new();
    h.store.put(key("a"), 5).await;

    let result = h.executor.submit(add("a", 3)).wait().await.unwrap();

    assert_eq!(result, 8);
    assert_eq!(h.store.get(&key("a")).await, Some(8));
}

#[tokio::test]
async fn test_submit_while_detached_then_resubmit_after_reconnect() {
    let h = Harness::new();
    h.store.put(key("a"), 5).await;
    let reconnect = h.tracker.detected("socket closed");

    let failure = h.executor.submit(add("a", 3)).wait().await.unwrap_err();
    assert!(failure.is_disconnected());
    let episode = failure.reconnect_future().expect("failure carries reconnect future");
    assert!(CacheFuture::same_instance(episode, &reconnect));
    assert_eq!(h.store.get(&key("a")).await, Some(5));

    assert!(h.tracker.reconnected());
    assert!(episode.clone().await.unwrap());

    let result = h.executor.submit(add("a", 3)).wait().await.unwrap();
    assert_eq!(result, 8);
    assert_eq!(h.store.get(&key("a")).await, Some(8));
}

#[tokio::test]
async fn test_failures_in_one_outage_share_reconnect_future() {
    let h = Harness::new();
    h.tracker.detected("switch rebooted");

    let mut futures = Vec::new();
    for name in ["a", "b", "c"] {
        let failure = h.executor.submit(add(name, 1)).wait().await.unwrap_err();
        futures.push(failure.reconnect_future().cloned().unwrap());
    }
    assert!(CacheFuture::same_instance(&futures[0], &futures[1]));
    assert!(CacheFuture::same_instance(&futures[1], &futures[2]));

    h.tracker.reconnected();
    let next_outage = h.tracker.detected("switch rebooted again");
    assert!(!CacheFuture::same_instance(&futures[0], &next_outage));
    assert_eq!(futures[0].state(), FutureState::Completed);
    assert_eq!(next_outage.state(), FutureState::Pending);
}

#[tokio::test]
async fn test_processor_error_is_user_code_even_when_link_drops() {
    let h = Harness::new();
    h.store.put(key("a"), 1).await;

    let tracker = Arc::clone(&h.tracker);
    let request = EntryMutationRequest::from_fn(
        key("a"),
        move |entry: &mut MutableEntry<String, i64>, _: &i64| -> Result<i64, ProcessorError> {
            tracker.detected("lost during processing");
            entry.set(99);
            Err(ProcessorError::new("validation failed"))
        },
        0,
    );

    let failure = h.executor.submit(request).wait().await.unwrap_err();

    assert!(failure.is_user_code());
    assert_eq!(failure.message(), "validation failed");
    assert!(failure.reconnect_future().is_none());
    assert!(!h.tracker.is_attached());
    assert_eq!(h.store.get(&key("a")).await, Some(1));
}

#[tokio::test]
async fn test_cancel_after_completion_is_noop() {
    let h = Harness::new();
    let future = h.executor.submit(add("a", 2));
    assert_eq!(future.wait().await.unwrap(), 2);

    assert!(!future.cancel());
    assert_eq!(future.state(), FutureState::Completed);
    assert_eq!(future.wait().await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_serialized() {
    let h = Harness::new();
    h.store.put(key("a"), 5).await;

    let first = h.executor.submit(add("a", 3));
    let second = h.executor.submit(add("a", 3));
    let (r1, r2) = futures::future::join(first.wait(), second.wait()).await;

    let mut results = vec![r1.unwrap(), r2.unwrap()];
    results.sort_unstable();
    assert_eq!(results, vec![8, 11]);
    assert_eq!(h.store.get(&key("a")).await, Some(11));
    assert_eq!(h.store.commit_count(), 2);
}

#[tokio::test]
async fn test_cancel_before_commit_leaves_entry_untouched() {
    let h = Harness::new();
    h.store.put(key("a"), 5).await;
    h.store.set_execution_delay(Some(Duration::from_millis(200)));

    let future = h.executor.submit(add("a", 3));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(future.cancel());
    let failure = future.wait().await.unwrap_err();
    assert!(failure.is_cancelled());

    h.store.set_execution_delay(None);
    assert_eq!(h.store.get(&key("a")).await, Some(5));
    assert_eq!(h.store.commit_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_commit_reports_what_happened() {
    let h = Harness::new();
    h.store.set_execution_delay(Some(Duration::from_millis(1)));

    for round in 0..50u64 {
        let name = format!("k{}", round);
        h.store.put(key(&name), 0).await;

        let future = h.executor.submit(add(&name, 1));
        tokio::time::sleep(Duration::from_micros(round * 40)).await;
        future.cancel();

        let outcome = tokio::time::timeout(TEST_TIMEOUT, future.wait())
            .await
            .expect("future settles");
        let stored = h.store.get(&key(&name)).await;
        match outcome {
            Ok(value) => {
                assert_eq!(value, 1);
                assert_eq!(stored, Some(1), "completed future must have committed");
            }
            Err(failure) => {
                assert!(failure.is_cancelled());
                assert_eq!(stored, Some(0), "cancelled future must not commit");
            }
        }
    }
}

#[tokio::test]
async fn test_unreachable_key_fails_preflight() {
    let h = Harness::new();
    h.store.mark_unreachable(key("cold"));

    let failure = h.executor.submit(add("cold", 1)).wait().await.unwrap_err();
    assert!(failure.is_disconnected());
    assert!(failure.reconnect_future().is_none());
    assert_eq!(h.store.commit_count(), 0);

    h.store.mark_reachable(&key("cold"));
    assert_eq!(h.executor.submit(add("cold", 1)).wait().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unreachable_key_without_preflight_fails_in_router() {
    let store = Arc::new(LocalEntryStore::<String, i64>::new());
    let tracker = Arc::new(ConnectionTracker::new());
    let config = ExecutorConfig {
        preflight_reachability_check: false,
        ..ExecutorConfig::default()
    };
    let executor =
        EntryProcessorExecutor::with_config(Arc::clone(&store), tracker, config).unwrap();
    store.set_reachable(false);

    let failure = executor.submit(add("a", 1)).wait().await.unwrap_err();
    assert!(failure.is_disconnected());
    assert!(failure.message().contains("unreachable"));
}

#[tokio::test]
async fn test_link_loss_mid_request_is_disconnected() {
    let h = Harness::new();
    h.store.put(key("a"), 5).await;
    h.store.fail_next_with_link_loss();

    let failure = h.executor.submit(add("a", 1)).wait().await.unwrap_err();
    assert!(failure.is_disconnected());
    assert_eq!(h.store.get(&key("a")).await, Some(5));

    // one-shot injection, the next request goes through
    assert_eq!(h.executor.submit(add("a", 1)).wait().await.unwrap(), 6);
}

/// Router whose link drops during every request, signalling the tracker first
struct DroppingRouter {
    tracker: Arc<ConnectionTracker>,
}

#[async_trait]
impl EntryRouter<String, i64> for DroppingRouter {
    async fn route_and_execute<A, R>(
        &self,
        _key: String,
        _processor: Arc<dyn EntryProcessor<String, i64, A, R>>,
        _arg: A,
        _gate: CommitGate,
    ) -> Result<R, RemoteFailure>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
    {
        tokio::task::yield_now().await;
        self.tracker.detected("peer closed connection");
        Err(RemoteFailure::LinkLost {
            reason: "peer closed connection".to_string(),
        })
    }

    fn is_reachable(&self, _key: &String) -> bool {
        true
    }
}

#[tokio::test]
async fn test_link_loss_carries_episode_future() {
    let tracker = Arc::new(ConnectionTracker::new());
    let router = Arc::new(DroppingRouter {
        tracker: Arc::clone(&tracker),
    });
    let executor = EntryProcessorExecutor::new(router, Arc::clone(&tracker)).unwrap();

    let failure = executor.submit(add("a", 1)).wait().await.unwrap_err();

    assert!(failure.is_disconnected());
    let reconnect = failure.reconnect_future().expect("episode future attached");
    assert!(CacheFuture::same_instance(
        reconnect,
        &executor.current_reconnect_future()
    ));

    tracker.reconnect_failed(gridcache_core::OperationFailure::disconnected("refused"));
    assert!(reconnect.clone().await.unwrap_err().is_disconnected());
}

#[tokio::test]
async fn test_panicking_processor_fails_with_user_code() {
    let h = Harness::new();
    h.store.put(key("a"), 5).await;

    let request = EntryMutationRequest::from_fn(
        key("a"),
        |entry: &mut MutableEntry<String, i64>, _: &i64| -> Result<i64, ProcessorError> {
            entry.set(1000);
            panic!("counter overflow");
        },
        0,
    );

    let failure = tokio::time::timeout(TEST_TIMEOUT, h.executor.submit(request).wait())
        .await
        .expect("panicking processor still settles its future")
        .unwrap_err();
    assert!(failure.is_user_code());
    assert!(failure.message().contains("panicked"));
    assert!(failure.message().contains("counter overflow"));
    assert_eq!(h.store.get(&key("a")).await, Some(5));
    assert_eq!(h.store.commit_count(), 0);

    // the entry lock was released during unwinding
    let result = tokio::time::timeout(TEST_TIMEOUT, h.executor.submit(add("a", 3)).wait())
        .await
        .expect("next request on the key is not blocked")
        .unwrap();
    assert_eq!(result, 8);
}

#[tokio::test]
async fn test_link_drop_mid_request_fails_disconnected() {
    let h = Harness::new();
    h.store.put(key("a"), 5).await;
    h.store.set_execution_delay(Some(Duration::from_millis(300)));

    let future = h.executor.submit(add("a", 3));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let reconnect = h.tracker.detected("switch port flapped");

    let failure = tokio::time::timeout(TEST_TIMEOUT, future.wait())
        .await
        .expect("in-flight request settles when the link drops")
        .unwrap_err();
    assert!(failure.is_disconnected());
    let episode = failure.reconnect_future().expect("failure carries reconnect future");
    assert!(CacheFuture::same_instance(episode, &reconnect));

    h.store.set_execution_delay(None);
    assert_eq!(h.store.get(&key("a")).await, Some(5));
    assert_eq!(h.store.commit_count(), 0);
}

/// Router that begins committing and only then loses the link
struct CommitThenDropRouter {
    tracker: Arc<ConnectionTracker>,
}

#[async_trait]
impl EntryRouter<String, i64> for CommitThenDropRouter {
    async fn route_and_execute<A, R>(
        &self,
        key: String,
        processor: Arc<dyn EntryProcessor<String, i64, A, R>>,
        arg: A,
        gate: CommitGate,
    ) -> Result<R, RemoteFailure>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
    {
        let mut entry = MutableEntry::new(key, Some(41));
        let result = processor.process(&mut entry, &arg)?;
        assert!(gate.try_commit());
        self.tracker.detected("link dropped after commit began");
        tokio::task::yield_now().await;
        Ok(result)
    }

    fn is_reachable(&self, _key: &String) -> bool {
        true
    }
}

#[tokio::test]
async fn test_link_drop_after_commit_began_reports_result() {
    let tracker = Arc::new(ConnectionTracker::new());
    let router = Arc::new(CommitThenDropRouter {
        tracker: Arc::clone(&tracker),
    });
    let executor = EntryProcessorExecutor::new(router, Arc::clone(&tracker)).unwrap();

    let result = tokio::time::timeout(TEST_TIMEOUT, executor.submit(add("a", 1)).wait())
        .await
        .expect("future settles");

    assert_eq!(result.unwrap(), 42);
    assert!(!tracker.is_attached());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reader_sees_only_committed_values() {
    let h = Harness::new();
    h.store.put(key("a"), 5).await;
    h.store.set_execution_delay(Some(Duration::from_millis(50)));

    let first = h.executor.submit(add("a", 3));
    let second = h.executor.submit(add("a", 3));

    let store = Arc::clone(&h.store);
    let watched = (first.clone(), second.clone());
    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            let done = watched.0.state() != FutureState::Pending
                && watched.1.state() != FutureState::Pending;
            if let Some(value) = store.get(&key("a")).await {
                seen.push(value);
            }
            if done {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let (r1, r2) = futures::future::join(first.wait(), second.wait()).await;
    let mut results = vec![r1.unwrap(), r2.unwrap()];
    results.sort_unstable();
    assert_eq!(results, vec![8, 11]);

    let seen = tokio::time::timeout(TEST_TIMEOUT, reader)
        .await
        .expect("reader finishes")
        .unwrap();
    assert!(!seen.is_empty());
    assert!(
        seen.iter().all(|value| [5, 8, 11].contains(value)),
        "reader observed an uncommitted value: {:?}",
        seen
    );
    assert_eq!(seen.last(), Some(&11));
    assert_eq!(h.store.get(&key("a")).await, Some(11));
}

#[tokio::test]
async fn test_submit_all_reports_per_key_results() {
    let h = Harness::new();
    h.store.put(key("a"), 10).await;
    h.store.mark_unreachable(key("b"));

    let results = h
        .executor
        .submit_all(vec![key("a"), key("b"), key("c")], increment(), 2)
        .wait()
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[&key("a")].as_ref().ok(), Some(&12));
    assert!(results[&key("b")]
        .as_ref()
        .is_err_and(|failure| failure.is_disconnected()));
    assert_eq!(results[&key("c")].as_ref().ok(), Some(&2));
}

#[tokio::test]
async fn test_cancel_submit_all_cancels_pending_keys() {
    let h = Harness::new();
    h.store.put(key("a"), 1).await;
    h.store.put(key("b"), 1).await;
    h.store.set_execution_delay(Some(Duration::from_millis(200)));

    let aggregate = h
        .executor
        .submit_all(vec![key("a"), key("b")], increment(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(aggregate.cancel());
    assert!(aggregate.wait().await.unwrap_err().is_cancelled());

    // long enough for a leaked execution to have committed
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.store.commit_count(), 0);
    assert_eq!(h.store.get(&key("a")).await, Some(1));
    assert_eq!(h.store.get(&key("b")).await, Some(1));
}

#[tokio::test]
async fn test_duplicate_reconnect_signal_is_harmless() {
    let h = Harness::new();
    let reconnect = h.tracker.detected("lost");

    assert!(h.tracker.reconnected());
    assert!(!h.tracker.reconnected());
    assert!(reconnect.wait().await.unwrap());
    assert_eq!(h.executor.submit(add("a", 4)).wait().await.unwrap(), 4);
}

#[test]
fn test_executor_requires_runtime() {
    let store = Arc::new(LocalEntryStore::<String, i64>::new());
    let result = EntryProcessorExecutor::new(store, Arc::new(ConnectionTracker::new()));
    assert!(matches!(
        result.err(),
        Some(GridCacheError::ConfigurationError { .. })
    ));
}
