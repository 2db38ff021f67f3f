//! # Task Coordinator Module
//!
//! A keyed, coalescing work queue drained by one dedicated worker thread.
//!
//! ## Key Components
//!
//! - [`TaskCoordinator`] - submission API, flush/drain, shutdown
//! - [`sink`] - pluggable reporting of failed task bodies
//! - [`metrics`] - activity counters
//!
//! ## Semantics
//!
//! At most one item is pending per key. Submitting for a key that is already
//! pending replaces the pending body and payload (coalescing); the latest
//! payload submitted before execution starts is the one that runs. Once the
//! worker takes an item out of the pending map, a new submission for the same
//! key starts a fresh pending item.
//!
//! Items submitted with `needs_lock` run while holding the key's monitor in
//! the coordinator's [`KeyMutexRegistry`]. If the monitor cannot be taken
//! within the configured lock timeout the item goes back to the pending map
//! (unless a newer submission already took the slot) and the sweep moves on.
//!
//! Ordering is advisory only. Failed bodies are reported and discarded, never
//! retried.
//!
//! ```rust,no_run
//! use keysync_core::config::TaskCoordinatorConfig;
//! use keysync_core::coordinator::TaskCoordinator;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator: TaskCoordinator<String, u64> =
//!     TaskCoordinator::new(TaskCoordinatorConfig::default())?;
//!
//! coordinator.submit(
//!     "inventory:42".to_string(),
//!     |quantity| {
//!         println!("persisting quantity {quantity}");
//!         Ok(true)
//!     },
//!     7,
//!     true,
//! );
//!
//! coordinator.process_all(Duration::from_secs(5));
//! coordinator.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod metrics;
mod queue;
pub mod sink;
pub mod task;
mod worker;

#[cfg(test)]
mod tests;

use crossbeam::channel::{self, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::TaskCoordinatorConfig;
use crate::error::Result;
use crate::sync::{deadline_after, deadline_passed, KeyMutexRegistry, LockKey};

use self::queue::{CoordinatorShared, InsertMode};
use self::task::TaskItem;
use self::worker::WorkerHandle;

pub use self::metrics::CoordinatorMetrics;
pub use self::sink::{TaskFailure, TaskFailureReason, TaskFailureSink, TracingFailureSink};
pub use self::task::TaskBody;

/// How often `ensure_complete_idempotent` re-checks the key
const ENSURE_COMPLETE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for a [`TaskCoordinator`] with a shared registry or custom sink
pub struct TaskCoordinatorBuilder<K> {
    config: TaskCoordinatorConfig,
    registry: Option<Arc<KeyMutexRegistry<K>>>,
    failure_sink: Option<Arc<dyn TaskFailureSink>>,
}

impl<K: LockKey> TaskCoordinatorBuilder<K> {
    pub fn new(config: TaskCoordinatorConfig) -> Self {
        Self {
            config,
            registry: None,
            failure_sink: None,
        }
    }

    /// Use an existing key mutex registry, shared with other callers
    pub fn registry(mut self, registry: Arc<KeyMutexRegistry<K>>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Report failed bodies to `sink` instead of the tracing default
    pub fn failure_sink(mut self, sink: Arc<dyn TaskFailureSink>) -> Self {
        self.failure_sink = Some(sink);
        self
    }

    /// Validate the configuration and start the worker thread
    pub fn build<P: Send + 'static>(self) -> Result<TaskCoordinator<K, P>> {
        self.config.validate()?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(KeyMutexRegistry::new()));
        let failure_sink = self
            .failure_sink
            .unwrap_or_else(|| Arc::new(TracingFailureSink));

        let shared = Arc::new(CoordinatorShared::new(self.config, registry, failure_sink));
        let (wake_tx, wake_rx) = channel::bounded::<()>(1);
        let worker = WorkerHandle::spawn(Arc::clone(&shared), wake_rx)?;

        info!(
            coordinator_id = %shared.id,
            capacity = shared.config.queue_capacity,
            lock_timeout_ms = shared.config.lock_timeout_ms,
            "🏗️ COORDINATOR: Created TaskCoordinator"
        );

        Ok(TaskCoordinator {
            shared,
            wake_tx,
            worker: Mutex::new(Some(worker)),
        })
    }
}

/// Coalescing, key-serialized background task queue
///
/// Submissions never block. One worker thread executes items; `process_all`
/// lets a caller flush the queue synchronously. Dropping the coordinator runs
/// [`shutdown`](Self::shutdown).
pub struct TaskCoordinator<K: LockKey, P: Send + 'static> {
    shared: Arc<CoordinatorShared<K, P>>,
    wake_tx: Sender<()>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl<K: LockKey, P: Send + 'static> TaskCoordinator<K, P> {
    /// Create a coordinator with its own key mutex registry
    pub fn new(config: TaskCoordinatorConfig) -> Result<Self> {
        TaskCoordinatorBuilder::new(config).build()
    }

    /// Queue `body(payload)` under `key`, replacing any item still pending
    /// for that key.
    ///
    /// Returns `false` only when the coordinator is shut down or the queue is
    /// at capacity. Replacing a pending item is always accepted.
    pub fn submit<F>(&self, key: K, body: F, payload: P, needs_lock: bool) -> bool
    where
        F: FnOnce(P) -> anyhow::Result<bool> + Send + 'static,
    {
        let item = TaskItem::new(Box::new(body), payload, needs_lock);
        let accepted = self.shared.insert(key, item, InsertMode::Coalesce);
        if accepted {
            self.wake();
        }
        accepted
    }

    /// Queue `body(payload)` under `key` only if nothing is pending for it.
    ///
    /// An existing pending item is left untouched and the call still returns
    /// `true`.
    pub fn try_add_idempotent<F>(&self, key: K, body: F, payload: P, needs_lock: bool) -> bool
    where
        F: FnOnce(P) -> anyhow::Result<bool> + Send + 'static,
    {
        let item = TaskItem::new(Box::new(body), payload, needs_lock);
        let accepted = self.shared.insert(key, item, InsertMode::KeepExisting);
        if accepted {
            self.wake();
        }
        accepted
    }

    /// Whether an item is pending for `key`
    pub fn contains(&self, key: &K) -> bool {
        self.shared.contains(key)
    }

    /// Number of pending items
    pub fn count(&self) -> usize {
        self.shared.count()
    }

    /// Run pending items on the calling thread until none are left or
    /// `timeout` elapses. Returns `true` when the queue ended up empty.
    #[instrument(skip(self), fields(coordinator_id = %self.shared.id))]
    pub fn process_all(&self, timeout: Duration) -> bool {
        self.shared.drain(timeout)
    }

    /// Wait until `key` is neither pending nor executing, up to `timeout`
    pub fn ensure_complete_idempotent(&self, key: &K, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);

        loop {
            if !self.shared.is_busy(key) {
                return true;
            }
            if deadline_passed(deadline) {
                return false;
            }
            thread::sleep(ENSURE_COMPLETE_POLL_INTERVAL);
        }
    }

    /// Stop accepting work, stop the worker, then drain once more.
    ///
    /// Returns `true` when nothing was left pending. Calling it again is
    /// harmless.
    #[instrument(skip(self), fields(coordinator_id = %self.shared.id))]
    pub fn shutdown(&self) -> bool {
        let first = self.shared.mark_shut_down();
        let worker = self.worker.lock().take();

        let Some(worker) = worker else {
            return self.shared.count() == 0;
        };

        if first {
            info!("🛑 COORDINATOR: Shutting down TaskCoordinator");
        }

        let joined = worker.stop(self.shared.config.worker_join_timeout());
        let drained = self.shared.drain(self.shared.config.shutdown_grace_period());

        if drained {
            info!(joined = joined, "✅ COORDINATOR: TaskCoordinator stopped");
        } else {
            warn!(
                joined = joined,
                remaining = self.shared.count(),
                "COORDINATOR: Shutdown drain incomplete, remaining tasks dropped"
            );
        }
        drained
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// The registry whose monitors guard `needs_lock` items
    pub fn registry(&self) -> &Arc<KeyMutexRegistry<K>> {
        &self.shared.registry
    }

    pub fn config(&self) -> &TaskCoordinatorConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        self.shared.metrics.snapshot(self.shared.count())
    }

    fn wake(&self) {
        if !self.shared.config.wake_on_submit {
            return;
        }
        // A full channel already holds a pending wake-up
        if let Err(TrySendError::Disconnected(())) = self.wake_tx.try_send(()) {
            warn!(coordinator_id = %self.shared.id, "Worker wake channel disconnected");
        }
    }
}

impl<K: LockKey, P: Send + 'static> Drop for TaskCoordinator<K, P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<K: LockKey, P: Send + 'static> fmt::Debug for TaskCoordinator<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCoordinator")
            .field("id", &self.shared.id)
            .field("pending", &self.shared.count())
            .field("shut_down", &self.shared.is_shut_down())
            .finish()
    }
}
