//! # Task Coordinator Tests
//!
//! Coverage for coalescing, idempotent adds, capacity and shutdown
//! rejection, failure reporting, key-mutex gated execution and completion
//! waits.
//!
//! Most tests use a "manual" configuration: the worker is never woken by
//! submissions and polls once a minute, so the test thread drives execution
//! through `process_all`.

use crossbeam::channel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::*;

#[derive(Debug, Default)]
struct RecordingSink {
    failures: Mutex<Vec<TaskFailure>>,
}

impl RecordingSink {
    fn reasons(&self) -> Vec<(String, TaskFailureReason)> {
        let mut reasons: Vec<_> = self
            .failures
            .lock()
            .iter()
            .map(|failure| (failure.key.clone(), failure.reason.clone()))
            .collect();
        reasons.sort_by(|a, b| a.0.cmp(&b.0));
        reasons
    }
}

impl TaskFailureSink for RecordingSink {
    fn record(&self, failure: &TaskFailure) {
        self.failures.lock().push(failure.clone());
    }
}

fn manual_config() -> TaskCoordinatorConfig {
    TaskCoordinatorConfig::default()
        .with_wake_on_submit(false)
        .with_poll_interval(Duration::from_secs(60))
        .with_lock_timeout(Duration::from_millis(10))
        .with_shutdown_grace_period(Duration::from_secs(1))
}

fn manual_coordinator() -> TaskCoordinator<u32, u32> {
    TaskCoordinator::new(manual_config()).unwrap()
}

/// Body that appends its payload to `log`
fn recorder(
    log: &Arc<Mutex<Vec<u32>>>,
) -> impl FnOnce(u32) -> anyhow::Result<bool> + Send + 'static {
    let log = Arc::clone(log);
    move |payload| {
        log.lock().push(payload);
        Ok(true)
    }
}

#[test]
fn test_submit_coalesces_pending_item() {
    let coordinator = manual_coordinator();
    let runs = Arc::new(Mutex::new(Vec::new()));

    assert!(coordinator.submit(1, recorder(&runs), 1, false));
    assert!(coordinator.submit(1, recorder(&runs), 2, false));

    assert_eq!(coordinator.count(), 1);
    assert!(coordinator.contains(&1));

    assert!(coordinator.process_all(Duration::from_secs(5)));
    assert_eq!(*runs.lock(), vec![2]);
    assert_eq!(coordinator.count(), 0);

    let metrics = coordinator.metrics();
    assert_eq!(metrics.submitted, 2);
    assert_eq!(metrics.coalesced, 1);
    assert_eq!(metrics.executed, 1);
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.pending, 0);
}

#[test]
fn test_try_add_idempotent_keeps_first_item() {
    let coordinator = manual_coordinator();
    let runs = Arc::new(Mutex::new(Vec::new()));

    assert!(coordinator.try_add_idempotent(5, recorder(&runs), 1, false));
    assert!(coordinator.try_add_idempotent(5, recorder(&runs), 2, false));
    assert_eq!(coordinator.count(), 1);

    assert!(coordinator.process_all(Duration::from_secs(5)));
    assert_eq!(*runs.lock(), vec![1]);
}

#[test]
fn test_distinct_keys_all_run() {
    let coordinator = manual_coordinator();
    let runs = Arc::new(Mutex::new(Vec::new()));

    for key in 0..10 {
        assert!(coordinator.submit(key, recorder(&runs), key * 10, key % 2 == 0));
    }
    assert_eq!(coordinator.count(), 10);

    assert!(coordinator.process_all(Duration::from_secs(5)));

    let mut seen = runs.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..10).map(|key| key * 10).collect::<Vec<_>>());
}

#[test]
fn test_capacity_rejects_new_keys_but_allows_coalescing() {
    let coordinator: TaskCoordinator<u32, u32> =
        TaskCoordinator::new(manual_config().with_queue_capacity(2)).unwrap();
    let runs = Arc::new(Mutex::new(Vec::new()));

    assert!(coordinator.submit(1, recorder(&runs), 1, false));
    assert!(coordinator.submit(2, recorder(&runs), 2, false));
    assert!(!coordinator.submit(3, recorder(&runs), 3, false));
    assert!(!coordinator.try_add_idempotent(3, recorder(&runs), 3, false));

    // Replacing a pending item does not need a new slot
    assert!(coordinator.submit(1, recorder(&runs), 11, false));
    assert_eq!(coordinator.count(), 2);
    assert!(!coordinator.contains(&3));
    assert_eq!(coordinator.metrics().rejected, 2);

    // Draining frees the slots again
    assert!(coordinator.process_all(Duration::from_secs(5)));
    assert!(coordinator.submit(3, recorder(&runs), 3, false));
}

#[test]
fn test_non_positive_capacity_is_unbounded() {
    let coordinator: TaskCoordinator<u32, u32> =
        TaskCoordinator::new(manual_config().with_queue_capacity(-1)).unwrap();
    let runs = Arc::new(Mutex::new(Vec::new()));

    for key in 0..500 {
        assert!(coordinator.submit(key, recorder(&runs), key, false));
    }
    assert_eq!(coordinator.count(), 500);
}

#[test]
fn test_submit_rejected_after_shutdown() {
    let coordinator = manual_coordinator();
    let runs = Arc::new(Mutex::new(Vec::new()));

    assert!(coordinator.shutdown());
    assert!(coordinator.is_shut_down());

    assert!(!coordinator.submit(1, recorder(&runs), 1, false));
    assert!(!coordinator.try_add_idempotent(1, recorder(&runs), 1, false));
    assert_eq!(coordinator.count(), 0);
    assert_eq!(coordinator.metrics().rejected, 2);
}

#[test]
fn test_shutdown_drains_pending_items() {
    let coordinator = manual_coordinator();
    let runs = Arc::new(Mutex::new(Vec::new()));

    for key in 0..5 {
        coordinator.submit(key, recorder(&runs), key, false);
    }

    assert!(coordinator.shutdown());
    assert_eq!(runs.lock().len(), 5);
    assert_eq!(coordinator.count(), 0);

    // Second call is a no-op
    assert!(coordinator.shutdown());
    assert_eq!(runs.lock().len(), 5);
}

#[test]
fn test_failures_are_reported_and_not_retried() {
    let sink = Arc::new(RecordingSink::default());
    let coordinator: TaskCoordinator<u32, u32> = TaskCoordinatorBuilder::new(manual_config())
        .failure_sink(Arc::clone(&sink) as Arc<dyn TaskFailureSink>)
        .build()
        .unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    coordinator.submit(
        1,
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        },
        0,
        false,
    );
    let counter = Arc::clone(&attempts);
    coordinator.submit(
        2,
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("storage unavailable"))
        },
        0,
        true,
    );
    let counter = Arc::clone(&attempts);
    coordinator.submit(
        3,
        move |_| -> anyhow::Result<bool> {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("corrupt payload")
        },
        0,
        false,
    );

    assert!(coordinator.process_all(Duration::from_secs(5)));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(coordinator.count(), 0);

    assert_eq!(
        sink.reasons(),
        vec![
            ("1".to_string(), TaskFailureReason::ReturnedFalse),
            (
                "2".to_string(),
                TaskFailureReason::Error("storage unavailable".to_string())
            ),
            (
                "3".to_string(),
                TaskFailureReason::Panicked("corrupt payload".to_string())
            ),
        ]
    );

    // Nothing comes back on the next flush
    assert!(coordinator.process_all(Duration::from_secs(1)));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let metrics = coordinator.metrics();
    assert_eq!(metrics.failed, 3);
    assert_eq!(metrics.succeeded, 0);
    assert_eq!(metrics.success_rate(), 0.0);
}

#[test]
fn test_locked_item_waits_for_external_key_holder() {
    let registry = Arc::new(KeyMutexRegistry::<u32>::new());
    let coordinator: TaskCoordinator<u32, u32> = TaskCoordinatorBuilder::new(manual_config())
        .registry(Arc::clone(&registry))
        .build()
        .unwrap();
    let runs = Arc::new(Mutex::new(Vec::new()));

    let (held_tx, held_rx) = channel::bounded::<()>(0);
    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let holder_registry = Arc::clone(&registry);
    let holder = thread::spawn(move || {
        assert!(holder_registry.try_enter(&7, Duration::from_secs(1)));
        held_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        holder_registry.exit(&7).unwrap();
    });
    held_rx.recv().unwrap();

    assert!(coordinator.submit(7, recorder(&runs), 70, true));
    assert!(!coordinator.process_all(Duration::from_millis(100)));
    assert!(coordinator.contains(&7));
    assert!(runs.lock().is_empty());
    assert!(coordinator.metrics().lock_retries > 0);

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    assert!(coordinator.process_all(Duration::from_secs(5)));
    assert_eq!(*runs.lock(), vec![70]);
}

#[test]
fn test_unlocked_item_ignores_key_holder() {
    let registry = Arc::new(KeyMutexRegistry::<u32>::new());
    let coordinator: TaskCoordinator<u32, u32> = TaskCoordinatorBuilder::new(manual_config())
        .registry(Arc::clone(&registry))
        .build()
        .unwrap();
    let runs = Arc::new(Mutex::new(Vec::new()));

    let (held_tx, held_rx) = channel::bounded::<()>(0);
    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let holder_registry = Arc::clone(&registry);
    let holder = thread::spawn(move || {
        let _guard = holder_registry.lock(&7, Duration::from_secs(1)).unwrap();
        held_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    held_rx.recv().unwrap();

    assert!(coordinator.submit(7, recorder(&runs), 70, false));
    assert!(coordinator.process_all(Duration::from_secs(5)));
    assert_eq!(*runs.lock(), vec![70]);

    release_tx.send(()).unwrap();
    holder.join().unwrap();
}

#[test]
fn test_body_runs_under_key_mutex() {
    let registry = Arc::new(KeyMutexRegistry::<u32>::new());
    let coordinator: TaskCoordinator<u32, u32> = TaskCoordinatorBuilder::new(manual_config())
        .registry(Arc::clone(&registry))
        .build()
        .unwrap();
    let observed = Arc::new(Mutex::new(None));

    let inner_registry = Arc::clone(&registry);
    let inner_observed = Arc::clone(&observed);
    coordinator.submit(
        3,
        move |key| {
            *inner_observed.lock() = Some(inner_registry.is_held_by_current_thread(&key));
            Ok(true)
        },
        3,
        true,
    );

    assert!(coordinator.process_all(Duration::from_secs(5)));
    assert_eq!(*observed.lock(), Some(true));
    assert!(!registry.is_locked(&3));
}

#[test]
fn test_worker_executes_on_wake() {
    let config = TaskCoordinatorConfig::default().with_poll_interval(Duration::from_millis(20));
    let coordinator: TaskCoordinator<String, u32> = TaskCoordinator::new(config).unwrap();
    let (done_tx, done_rx) = channel::bounded::<u32>(1);

    coordinator.submit(
        "order:1".to_string(),
        move |payload| {
            done_tx.send(payload).unwrap();
            Ok(true)
        },
        9,
        true,
    );

    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(9));
    assert!(coordinator.ensure_complete_idempotent(&"order:1".to_string(), Duration::from_secs(5)));
}

#[test]
fn test_submission_during_execution_starts_fresh_item() {
    let config = TaskCoordinatorConfig::default().with_poll_interval(Duration::from_millis(20));
    let coordinator: TaskCoordinator<u32, u32> = TaskCoordinator::new(config).unwrap();
    let runs = Arc::new(Mutex::new(Vec::new()));

    let (started_tx, started_rx) = channel::bounded::<()>(0);
    let (go_tx, go_rx) = channel::bounded::<()>(0);
    let first_runs = Arc::clone(&runs);
    coordinator.submit(
        1,
        move |payload| {
            started_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            first_runs.lock().push(payload);
            Ok(true)
        },
        1,
        false,
    );

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!coordinator.contains(&1));

    assert!(coordinator.submit(1, recorder(&runs), 2, false));
    assert!(coordinator.contains(&1));

    go_tx.send(()).unwrap();
    assert!(coordinator.ensure_complete_idempotent(&1, Duration::from_secs(5)));
    assert_eq!(*runs.lock(), vec![1, 2]);
}

#[test]
fn test_ensure_complete_idempotent() {
    let coordinator = manual_coordinator();
    let runs = Arc::new(Mutex::new(Vec::new()));

    // Unknown key is already complete
    assert!(coordinator.ensure_complete_idempotent(&42, Duration::ZERO));

    coordinator.submit(42, recorder(&runs), 1, false);

    // Nobody drains in manual mode, so the wait times out
    let started = Instant::now();
    assert!(!coordinator.ensure_complete_idempotent(&42, Duration::from_millis(30)));
    assert!(started.elapsed() >= Duration::from_millis(30));

    coordinator.process_all(Duration::from_secs(5));
    assert!(coordinator.ensure_complete_idempotent(&42, Duration::ZERO));
}

#[test]
fn test_process_all_zero_timeout_on_empty_queue() {
    let coordinator = manual_coordinator();
    assert!(coordinator.process_all(Duration::ZERO));
}

#[test]
fn test_invalid_config_fails_build() {
    let result: Result<TaskCoordinator<u32, u32>> =
        TaskCoordinator::new(manual_config().with_worker_name("  "));
    assert!(matches!(
        result,
        Err(crate::error::KeySyncError::Configuration(_))
    ));
}

#[test]
fn test_accessors() {
    let coordinator = manual_coordinator();
    assert_eq!(coordinator.config().lock_timeout(), Duration::from_millis(10));
    assert!(coordinator.registry().is_empty());
    assert!(!coordinator.is_shut_down());

    let other = manual_coordinator();
    assert_ne!(coordinator.id(), other.id());

    let rendered = format!("{coordinator:?}");
    assert!(rendered.contains("TaskCoordinator"));
}

#[derive(Debug)]
struct PanickingSink;

impl TaskFailureSink for PanickingSink {
    fn record(&self, _failure: &TaskFailure) {
        panic!("failure sink unavailable");
    }
}

/// Poll `condition` until it holds or `timeout` passes
fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Holds `key` on a separate thread until the returned sender is used
fn hold_key_elsewhere(
    registry: &Arc<KeyMutexRegistry<u32>>,
    key: u32,
) -> (channel::Sender<()>, thread::JoinHandle<()>) {
    let (held_tx, held_rx) = channel::bounded::<()>(0);
    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let registry = Arc::clone(registry);
    let holder = thread::spawn(move || {
        let _guard = registry.lock(&key, Duration::from_secs(1)).unwrap();
        held_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    held_rx.recv().unwrap();
    (release_tx, holder)
}

#[test]
fn test_worker_survives_panicking_failure_sink() {
    let config = TaskCoordinatorConfig::default().with_poll_interval(Duration::from_millis(10));
    let coordinator: TaskCoordinator<u32, u32> = TaskCoordinatorBuilder::new(config)
        .failure_sink(Arc::new(PanickingSink))
        .build()
        .unwrap();

    coordinator.submit(1, |_| Ok(false), 0, false);
    assert!(coordinator.ensure_complete_idempotent(&1, Duration::from_secs(5)));

    let (done_tx, done_rx) = channel::bounded::<u32>(1);
    coordinator.submit(
        2,
        move |payload| {
            done_tx.send(payload).unwrap();
            Ok(true)
        },
        22,
        false,
    );

    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(22));
    assert!(coordinator.ensure_complete_idempotent(&2, Duration::from_secs(5)));

    let metrics = coordinator.metrics();
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.succeeded, 1);
}

#[test]
fn test_lock_retry_yields_to_newer_submission() {
    let registry = Arc::new(KeyMutexRegistry::<u32>::new());
    let config = TaskCoordinatorConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_lock_timeout(Duration::from_millis(300));
    let coordinator: TaskCoordinator<u32, u32> = TaskCoordinatorBuilder::new(config)
        .registry(Arc::clone(&registry))
        .build()
        .unwrap();
    let runs = Arc::new(Mutex::new(Vec::new()));

    let (release_tx, holder) = hold_key_elsewhere(&registry, 7);

    assert!(coordinator.submit(7, recorder(&runs), 1, true));
    // The worker has taken the item and is waiting on the key mutex
    assert!(wait_for(Duration::from_secs(5), || !coordinator.contains(&7)));

    assert!(coordinator.submit(7, recorder(&runs), 2, true));
    assert!(wait_for(Duration::from_secs(5), || {
        coordinator.metrics().superseded_retries == 1
    }));

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    assert!(coordinator.ensure_complete_idempotent(&7, Duration::from_secs(5)));
    assert_eq!(*runs.lock(), vec![2]);
    assert_eq!(coordinator.metrics().superseded_retries, 1);
    assert_eq!(coordinator.metrics().executed, 1);
}

#[test]
fn test_process_all_lock_wait_respects_timeout() {
    let registry = Arc::new(KeyMutexRegistry::<u32>::new());
    let config = manual_config().with_lock_timeout(Duration::from_secs(2));
    let coordinator: TaskCoordinator<u32, u32> = TaskCoordinatorBuilder::new(config)
        .registry(Arc::clone(&registry))
        .build()
        .unwrap();
    let runs = Arc::new(Mutex::new(Vec::new()));

    let (release_tx, holder) = hold_key_elsewhere(&registry, 9);
    coordinator.submit(9, recorder(&runs), 90, true);

    let started = Instant::now();
    assert!(!coordinator.process_all(Duration::from_millis(50)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(coordinator.contains(&9));
    assert!(runs.lock().is_empty());

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    assert!(coordinator.process_all(Duration::from_secs(5)));
    assert_eq!(*runs.lock(), vec![90]);
}
