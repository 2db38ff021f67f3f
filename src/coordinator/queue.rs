//! Pending-item map and sweep logic shared by the worker thread and callers
//! of `process_all`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::metrics::MetricsRecorder;
use super::sink::{TaskFailure, TaskFailureSink};
use super::task::{panic_message, TaskItem};
use crate::config::TaskCoordinatorConfig;
use crate::logging::log_task_operation;
use crate::sync::{deadline_after, deadline_passed, KeyMutexRegistry, LockKey};

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepStats {
    pub(crate) executed: usize,
    pub(crate) requeued: usize,
}

/// Clears the in-flight marker when the current item is finished, including
/// when its execution unwinds.
struct InFlight<'a, K> {
    slot: &'a Mutex<Option<K>>,
}

impl<'a, K> InFlight<'a, K> {
    fn mark(slot: &'a Mutex<Option<K>>, key: K) -> Self {
        *slot.lock() = Some(key);
        Self { slot }
    }
}

impl<K> Drop for InFlight<'_, K> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// How a vacant-slot insert should treat the capacity bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertMode {
    /// Overwrite a pending item for the same key
    Coalesce,
    /// Leave a pending item for the same key untouched
    KeepExisting,
}

pub(crate) struct CoordinatorShared<K, P> {
    pub(crate) id: Uuid,
    id_label: String,
    pub(crate) config: TaskCoordinatorConfig,
    /// The mutex lets non-`Sync` bodies and payloads live in the shared map;
    /// items are only ever touched through the owning shard's lock.
    pending: DashMap<K, Mutex<TaskItem<P>>>,
    pending_count: AtomicUsize,
    capacity: Option<usize>,
    pub(crate) registry: Arc<KeyMutexRegistry<K>>,
    /// Held for the duration of a sweep so bodies never run concurrently
    sweep_lock: Mutex<()>,
    /// Key taken out of `pending` and not yet finished
    in_flight: Mutex<Option<K>>,
    shut_down: AtomicBool,
    pub(crate) metrics: MetricsRecorder,
    failure_sink: Arc<dyn TaskFailureSink>,
}

impl<K: LockKey, P: Send + 'static> CoordinatorShared<K, P> {
    pub(crate) fn new(
        config: TaskCoordinatorConfig,
        registry: Arc<KeyMutexRegistry<K>>,
        failure_sink: Arc<dyn TaskFailureSink>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            id_label: id.to_string(),
            capacity: config.capacity(),
            config,
            pending: DashMap::new(),
            pending_count: AtomicUsize::new(0),
            registry,
            sweep_lock: Mutex::new(()),
            in_flight: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            metrics: MetricsRecorder::default(),
            failure_sink,
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Returns `true` for the call that actually flipped the flag
    pub(crate) fn mark_shut_down(&self) -> bool {
        !self.shut_down.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn count(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Pending, or taken by a sweep and not finished yet
    pub(crate) fn is_busy(&self, key: &K) -> bool {
        self.pending.contains_key(key) || self.in_flight.lock().as_ref() == Some(key)
    }

    pub(crate) fn insert(&self, key: K, item: TaskItem<P>, mode: InsertMode) -> bool {
        if self.is_shut_down() {
            self.metrics.rejected();
            debug!(
                coordinator_id = %self.id,
                key = ?key,
                "Submission rejected: coordinator shut down"
            );
            return false;
        }

        let coalesced = match self.pending.entry(key) {
            Entry::Occupied(mut occupied) => {
                if mode == InsertMode::KeepExisting {
                    return true;
                }
                occupied.get_mut().get_mut().coalesce(item);
                true
            }
            Entry::Vacant(vacant) => {
                if !self.reserve_slot() {
                    self.metrics.rejected();
                    warn!(
                        coordinator_id = %self.id,
                        key = ?vacant.key(),
                        capacity = self.capacity.unwrap_or_default(),
                        "Submission rejected: queue at capacity"
                    );
                    return false;
                }
                vacant.insert(Mutex::new(item));
                false
            }
        };

        self.metrics.submitted(coalesced);
        true
    }

    /// One worker sweep. Skipped when another sweep (a `process_all` call)
    /// holds the sweep lock for longer than a poll interval.
    pub(crate) fn sweep_once(&self) -> Option<SweepStats> {
        let _sweep = self.sweep_lock.try_lock_for(self.config.poll_interval())?;
        Some(self.sweep_locked(None))
    }

    /// Sweep repeatedly until nothing is pending or the timeout elapses
    pub(crate) fn drain(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let sweep = match deadline {
            Some(deadline) => self.sweep_lock.try_lock_until(deadline),
            None => Some(self.sweep_lock.lock()),
        };
        let Some(_sweep) = sweep else {
            return self.pending.is_empty();
        };

        while !self.pending.is_empty() {
            if deadline_passed(deadline) {
                break;
            }
            let stats = self.sweep_locked(deadline);
            if stats.executed == 0 {
                // Everything left is waiting on a busy key mutex
                thread::yield_now();
            }
        }

        self.pending.is_empty()
    }

    fn sweep_locked(&self, deadline: Option<Instant>) -> SweepStats {
        let keys: Vec<K> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let mut stats = SweepStats::default();

        for key in keys {
            if deadline_passed(deadline) {
                break;
            }

            let _in_flight = InFlight::mark(&self.in_flight, key.clone());
            if let Some((key, item)) = self.pending.remove(&key) {
                self.pending_count.fetch_sub(1, Ordering::AcqRel);
                if self.execute(key, item.into_inner(), deadline) {
                    stats.executed += 1;
                } else {
                    stats.requeued += 1;
                }
            }
        }

        stats
    }

    /// Run one item. Returns `false` when the key mutex was busy and the item
    /// went back to the pending map instead.
    ///
    /// The key mutex wait never outlasts `deadline`.
    fn execute(&self, key: K, item: TaskItem<P>, deadline: Option<Instant>) -> bool {
        let _key_guard = if item.needs_lock {
            match self.registry.lock(&key, self.lock_wait(deadline)) {
                Some(guard) => Some(guard),
                None => {
                    self.requeue(key, item);
                    return false;
                }
            }
        } else {
            None
        };

        let key_label = format!("{key:?}");
        let queued_for = item.queued_for();
        let started = Instant::now();
        let result = item.run();
        let run_time = started.elapsed();

        match result {
            Ok(()) => {
                self.metrics.executed(true);
                log_task_operation("execute", &self.id_label, &key_label, "succeeded", None);
            }
            Err(reason) => {
                self.metrics.executed(false);
                log_task_operation(
                    "execute",
                    &self.id_label,
                    &key_label,
                    "failed",
                    Some(&reason.to_string()),
                );
                self.report_failure(&TaskFailure {
                    coordinator_id: self.id,
                    key: key_label,
                    reason,
                    queued_for,
                    run_time,
                });
            }
        }

        true
    }

    /// Hand a failure to the sink. A panicking sink is logged and otherwise
    /// ignored so the sweep carries on.
    fn report_failure(&self, failure: &TaskFailure) {
        let sink = &self.failure_sink;
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| sink.record(failure))) {
            error!(
                coordinator_id = %self.id,
                key = %failure.key,
                panic = %panic_message(panic.as_ref()),
                "Task failure sink panicked"
            );
        }
    }

    fn lock_wait(&self, deadline: Option<Instant>) -> Duration {
        let lock_timeout = self.config.lock_timeout();
        match deadline {
            Some(deadline) => lock_timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => lock_timeout,
        }
    }

    /// Put an item back after a failed lock attempt, unless a newer
    /// submission already claimed the key's slot.
    fn requeue(&self, key: K, item: TaskItem<P>) {
        match self.pending.entry(key) {
            Entry::Vacant(vacant) => {
                self.pending_count.fetch_add(1, Ordering::AcqRel);
                vacant.insert(Mutex::new(item));
                self.metrics.lock_retry();
            }
            Entry::Occupied(occupied) => {
                self.metrics.superseded_retry();
                debug!(
                    coordinator_id = %self.id,
                    key = ?occupied.key(),
                    "Newer submission holds the slot, dropping lock retry"
                );
            }
        }
    }

    fn reserve_slot(&self) -> bool {
        match self.capacity {
            None => {
                self.pending_count.fetch_add(1, Ordering::AcqRel);
                true
            }
            Some(capacity) => self
                .pending_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    (count < capacity).then_some(count + 1)
                })
                .is_ok(),
        }
    }
}
