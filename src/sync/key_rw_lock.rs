//! # Per-Key Reader/Writer Locks
//!
//! Shared/exclusive locking scoped to a key, with lazily created lock state
//! and idle eviction.
//!
//! By convention a **read** lock pins the resource associated with the key
//! (nobody may relocate or evict it while any reader is present), and a
//! **write** lock grants exclusive access under which the holder may relocate
//! or evict the resource. The registry only manages the lock state; it never
//! touches the resource itself.
//!
//! Lock state per key is re-entrant for the owning thread: nested reads,
//! nested writes and reads inside a write are allowed. Upgrading a held read
//! lock to a write lock is rejected because it would wait on itself.
//!
//! State removed by [`KeyReadWriteLock::remove_key`] or
//! [`KeyReadWriteLock::cleanup_unused_locks`] is *retired*: threads still
//! waiting on it wake up and retry against whatever state the registry holds
//! for the key at that point. Idle cleanup only retires state nobody holds
//! or waits on, so it never splits holders across two state objects.
//! `remove_key` does: the remover keeps its write handle on the retired
//! state, which no longer excludes anyone, while later callers lock a fresh
//! state. Removing a key therefore ends the remover's exclusivity, and the
//! handle only exists to be released.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{deadline_after, deadline_passed, wait_until, LockKey};
use crate::config::KeyLockConfig;
use crate::error::{KeySyncError, Result};
use crate::logging::log_lock_maintenance;

/// Which side of the reader/writer lock a handle holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    fn as_str(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct RwInner {
    writer: Option<ThreadId>,
    write_depth: usize,
    readers: HashMap<ThreadId, usize>,
    waiting_writers: usize,
    retired: bool,
}

impl RwInner {
    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

enum AcquireOutcome {
    Acquired,
    TimedOut,
    Retired,
    UpgradeRequested,
}

struct KeyLockState {
    inner: Mutex<RwInner>,
    changed: Condvar,
    /// Nanoseconds since the registry epoch of the last successful acquire
    last_access: AtomicU64,
}

impl KeyLockState {
    fn new(now: u64) -> Self {
        Self {
            inner: Mutex::new(RwInner::default()),
            changed: Condvar::new(),
            last_access: AtomicU64::new(now),
        }
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    fn acquire(
        &self,
        mode: LockMode,
        owner: ThreadId,
        deadline: Option<Instant>,
        now: impl Fn() -> u64,
    ) -> AcquireOutcome {
        let mut inner = self.inner.lock();

        loop {
            if inner.retired {
                return AcquireOutcome::Retired;
            }

            let granted = match mode {
                LockMode::Read => {
                    let nested = inner.writer == Some(owner) || inner.readers.contains_key(&owner);
                    // New readers queue behind waiting writers
                    if nested || (inner.writer.is_none() && inner.waiting_writers == 0) {
                        *inner.readers.entry(owner).or_insert(0) += 1;
                        true
                    } else {
                        false
                    }
                }
                LockMode::Write => {
                    if inner.writer == Some(owner) {
                        inner.write_depth += 1;
                        true
                    } else if inner.readers.contains_key(&owner) {
                        return AcquireOutcome::UpgradeRequested;
                    } else if inner.is_free() {
                        inner.writer = Some(owner);
                        inner.write_depth = 1;
                        true
                    } else {
                        false
                    }
                }
            };

            if granted {
                self.last_access.store(now(), Ordering::Release);
                return AcquireOutcome::Acquired;
            }

            if mode == LockMode::Write {
                inner.waiting_writers += 1;
            }
            let woke = wait_until(&self.changed, &mut inner, deadline);
            if mode == LockMode::Write {
                inner.waiting_writers -= 1;
            }

            if !woke {
                if mode == LockMode::Write {
                    // Readers held back by this writer may proceed now
                    self.changed.notify_all();
                }
                return AcquireOutcome::TimedOut;
            }
        }
    }

    fn release(&self, mode: LockMode, owner: ThreadId) {
        let mut inner = self.inner.lock();
        match mode {
            LockMode::Read => {
                if let Some(count) = inner.readers.get_mut(&owner) {
                    *count -= 1;
                    if *count == 0 {
                        inner.readers.remove(&owner);
                    }
                }
            }
            LockMode::Write => {
                if inner.writer == Some(owner) {
                    inner.write_depth -= 1;
                    if inner.write_depth == 0 {
                        inner.writer = None;
                    }
                }
            }
        }
        drop(inner);
        self.changed.notify_all();
    }

    fn is_write_held_by(&self, owner: ThreadId) -> bool {
        self.inner.lock().writer == Some(owner)
    }
}

/// Handle for a held key lock
///
/// Releases exactly once: either through [`release`](Self::release) or on
/// drop, whichever comes first. Further releases are no-ops.
#[must_use = "the key lock is released as soon as the handle is dropped"]
pub struct KeyLockHandle<K> {
    key: K,
    mode: LockMode,
    owner: ThreadId,
    state: Option<Arc<KeyLockState>>,
    _not_send: PhantomData<*const ()>,
}

impl<K> KeyLockHandle<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_released(&self) -> bool {
        self.state.is_none()
    }

    /// Release the lock. Idempotent.
    pub fn release(&mut self) {
        if let Some(state) = self.state.take() {
            state.release(self.mode, self.owner);
        }
    }
}

impl<K> Drop for KeyLockHandle<K> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<K: fmt::Debug> fmt::Debug for KeyLockHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockHandle")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Registry of per-key reader/writer locks
pub struct KeyReadWriteLock<K> {
    states: DashMap<K, Arc<KeyLockState>>,
    epoch: Instant,
    config: KeyLockConfig,
}

impl<K: LockKey> Default for KeyReadWriteLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: LockKey> KeyReadWriteLock<K> {
    pub fn new() -> Self {
        Self::with_config(KeyLockConfig::default())
    }

    pub fn with_config(config: KeyLockConfig) -> Self {
        Self {
            states: DashMap::new(),
            epoch: Instant::now(),
            config,
        }
    }

    pub fn config(&self) -> &KeyLockConfig {
        &self.config
    }

    /// Try to take a shared lock on `key` within `timeout`
    ///
    /// Returns `None` on timeout. Never fails otherwise: a read inside a held
    /// write lock, or a nested read, is granted immediately.
    pub fn try_acquire_read_lock(&self, key: &K, timeout: Duration) -> Option<KeyLockHandle<K>> {
        match self.acquire(key, LockMode::Read, timeout) {
            Ok(handle) => handle,
            // Read acquisition has no upgrade path
            Err(_) => None,
        }
    }

    /// Try to take an exclusive lock on `key` within `timeout`
    ///
    /// Returns `Ok(None)` on timeout and an error only when the calling thread
    /// already holds a read lock on the key.
    pub fn try_acquire_write_lock(
        &self,
        key: &K,
        timeout: Duration,
    ) -> Result<Option<KeyLockHandle<K>>> {
        self.acquire(key, LockMode::Write, timeout)
    }

    /// Take a shared lock, failing with [`KeySyncError::LockTimeout`] on timeout
    pub fn acquire_read_lock(&self, key: &K, timeout: Duration) -> Result<KeyLockHandle<K>> {
        self.try_acquire_read_lock(key, timeout)
            .ok_or_else(|| Self::timeout_error(key, LockMode::Read, timeout))
    }

    /// Take an exclusive lock, failing with [`KeySyncError::LockTimeout`] on timeout
    pub fn acquire_write_lock(&self, key: &K, timeout: Duration) -> Result<KeyLockHandle<K>> {
        self.try_acquire_write_lock(key, timeout)?
            .ok_or_else(|| Self::timeout_error(key, LockMode::Write, timeout))
    }

    /// [`acquire_read_lock`](Self::acquire_read_lock) with the configured default timeout
    pub fn acquire_read_lock_default(&self, key: &K) -> Result<KeyLockHandle<K>> {
        self.acquire_read_lock(key, self.config.default_lock_timeout())
    }

    /// [`acquire_write_lock`](Self::acquire_write_lock) with the configured default timeout
    pub fn acquire_write_lock_default(&self, key: &K) -> Result<KeyLockHandle<K>> {
        self.acquire_write_lock(key, self.config.default_lock_timeout())
    }

    /// Delete the lock state for `key`.
    ///
    /// The calling thread must hold the key's write lock. Returns `Ok(false)`
    /// when there is no state for the key. Handles already issued stay valid
    /// and release against the retired state.
    pub fn remove_key(&self, key: &K) -> Result<bool> {
        let Some(state) = self.states.get(key).map(|state| Arc::clone(state.value())) else {
            return Ok(false);
        };

        let owner = thread::current().id();
        let mut inner = state.inner.lock();
        if inner.writer != Some(owner) {
            return Err(KeySyncError::WriteLockNotHeld {
                key: format!("{key:?}"),
            });
        }

        inner.retired = true;
        self.states.remove_if(key, |_, current| Arc::ptr_eq(current, &state));
        drop(inner);
        state.changed.notify_all();

        debug!(key = ?key, "Removed key lock state");
        Ok(true)
    }

    /// Remove lock state for keys idle longer than `idle_threshold`.
    ///
    /// A key is only removed if its lock is free at the moment of removal and
    /// its access time, checked again under the state lock, is still stale.
    /// Keys that are busy or became active during the scan are skipped.
    pub fn cleanup_unused_locks(&self, idle_threshold: Duration) -> usize {
        let now = self.now();
        let threshold = u64::try_from(idle_threshold.as_nanos()).unwrap_or(u64::MAX);
        let Some(cutoff) = now.checked_sub(threshold) else {
            return 0;
        };

        let snapshot: Vec<(K, Arc<KeyLockState>)> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let scanned = snapshot.len();
        let mut removed = 0_usize;

        for (key, state) in snapshot {
            if state.last_access() >= cutoff {
                continue;
            }
            if self.retire_if_idle(&key, &state, cutoff) {
                removed += 1;
            }
        }

        log_lock_maintenance("key_rw_lock", "cleanup_unused_locks", scanned, removed);
        removed
    }

    /// [`cleanup_unused_locks`](Self::cleanup_unused_locks) with the configured idle threshold
    pub fn cleanup_idle(&self) -> usize {
        self.cleanup_unused_locks(self.config.idle_threshold())
    }

    /// Whether the calling thread holds the write lock for `key`
    pub fn is_write_locked_by_current_thread(&self, key: &K) -> bool {
        self.states
            .get(key)
            .map(|state| Arc::clone(state.value()))
            .is_some_and(|state| state.is_write_held_by(thread::current().id()))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.states.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn acquire(
        &self,
        key: &K,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Option<KeyLockHandle<K>>> {
        let owner = thread::current().id();
        let deadline = deadline_after(timeout);

        loop {
            let state = self.state_for(key);

            match state.acquire(mode, owner, deadline, || self.now()) {
                AcquireOutcome::Acquired => {
                    return Ok(Some(KeyLockHandle {
                        key: key.clone(),
                        mode,
                        owner,
                        state: Some(state),
                        _not_send: PhantomData,
                    }));
                }
                AcquireOutcome::TimedOut => {
                    trace!(key = ?key, mode = %mode, "Key lock acquisition timed out");
                    return Ok(None);
                }
                AcquireOutcome::UpgradeRequested => {
                    return Err(KeySyncError::LockUpgradeNotSupported {
                        key: format!("{key:?}"),
                    });
                }
                AcquireOutcome::Retired => {
                    trace!(key = ?key, mode = %mode, "Key lock state retired, retrying");
                    if deadline_passed(deadline) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn state_for(&self, key: &K) -> Arc<KeyLockState> {
        if let Some(state) = self.states.get(key) {
            return Arc::clone(state.value());
        }

        let now = self.now();
        self.states
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyLockState::new(now)))
            .value()
            .clone()
    }

    /// Non-blocking exclusive grab plus timestamp re-check, then retire and
    /// unregister while still holding the state lock.
    fn retire_if_idle(&self, key: &K, state: &Arc<KeyLockState>, cutoff: u64) -> bool {
        let Some(mut inner) = state.inner.try_lock() else {
            return false;
        };

        if inner.retired || !inner.is_free() || inner.waiting_writers > 0 {
            return false;
        }

        // Re-check: the key may have been used since the scan read its timestamp
        if state.last_access() >= cutoff {
            return false;
        }

        inner.retired = true;
        self.states.remove_if(key, |_, current| Arc::ptr_eq(current, state));
        drop(inner);
        state.changed.notify_all();

        trace!(key = ?key, "Evicted idle key lock state");
        true
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn timeout_error(key: &K, mode: LockMode, timeout: Duration) -> KeySyncError {
        KeySyncError::LockTimeout {
            key: format!("{key:?}"),
            mode: mode.as_str(),
            timeout,
        }
    }
}

impl<K: LockKey> fmt::Debug for KeyReadWriteLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyReadWriteLock")
            .field("states", &self.states.len())
            .field("config", &self.config)
            .finish()
    }
}
