//! # Key Mutex Registry
//!
//! "Lock by value": every key is interned to a single canonical entry, and the
//! canonical entry doubles as the key's monitor. Two distinct `String`s with
//! the same contents therefore contend for the same lock.
//!
//! Canonical entries that are not locked can be dropped by [`KeyMutexRegistry::trim_excess`].
//! A thread that interned a key just before a trim may end up acquiring the
//! monitor of an entry that is no longer registered; [`KeyMutexRegistry::try_enter`]
//! detects that after acquiring, releases, and retries against a fresh entry
//! within the remaining timeout budget.
//!
//! ```rust
//! use keysync_core::sync::KeyMutexRegistry;
//! use std::time::Duration;
//!
//! let registry = KeyMutexRegistry::new();
//! let account = String::from("account-42");
//!
//! if registry.try_enter(&account, Duration::from_millis(50)) {
//!     // ... exclusive work for "account-42" ...
//!     registry.exit(&"account-42".to_string()).unwrap();
//! }
//!
//! // Scoped form, released on drop
//! if let Some(_guard) = registry.lock(&account, Duration::from_millis(50)) {
//!     // ...
//! }
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::monitor::Monitor;
use super::{deadline_after, deadline_passed, LockKey};
use crate::error::{KeySyncError, Result};
use crate::logging::log_lock_maintenance;

struct CanonicalEntry<K> {
    key: K,
    monitor: Monitor,
}

/// Opaque handle to the canonical instance of a key
///
/// Handles compare by *identity* through [`CanonicalKey::ptr_eq`]: two handles
/// obtained for equal keys are the same instance as long as the entry was not
/// trimmed in between.
pub struct CanonicalKey<K> {
    entry: Arc<CanonicalEntry<K>>,
}

impl<K> CanonicalKey<K> {
    /// The key value that won the intern race
    pub fn key(&self) -> &K {
        &self.entry.key
    }

    /// Reference identity, not value equality
    pub fn ptr_eq(&self, other: &CanonicalKey<K>) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    pub fn is_locked(&self) -> bool {
        self.entry.monitor.is_locked()
    }
}

impl<K> Clone for CanonicalKey<K> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for CanonicalKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanonicalKey")
            .field("key", &self.entry.key)
            .field("locked", &self.entry.monitor.is_locked())
            .finish()
    }
}

/// Scoped hold on a key's monitor, released when dropped
///
/// The monitor is owned by the thread that acquired it, so the guard cannot
/// leave that thread.
#[must_use = "the key lock is released as soon as the guard is dropped"]
pub struct KeyMutexGuard<K> {
    canonical: CanonicalKey<K>,
    _not_send: PhantomData<*const ()>,
}

impl<K> KeyMutexGuard<K> {
    pub fn canonical(&self) -> &CanonicalKey<K> {
        &self.canonical
    }

    pub fn key(&self) -> &K {
        self.canonical.key()
    }
}

impl<K> Drop for KeyMutexGuard<K> {
    fn drop(&mut self) {
        self.canonical.entry.monitor.exit();
    }
}

impl<K: fmt::Debug> fmt::Debug for KeyMutexGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMutexGuard")
            .field("key", self.key())
            .finish()
    }
}

/// Registry mapping value-equal keys to one canonical monitor
pub struct KeyMutexRegistry<K> {
    entries: DashMap<K, Arc<CanonicalEntry<K>>>,
    /// Serializes `trim_excess` calls
    trim_lock: Mutex<()>,
}

impl<K: LockKey> Default for KeyMutexRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: LockKey> KeyMutexRegistry<K> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            trim_lock: Mutex::new(()),
        }
    }

    /// Return the canonical instance equal to `key`, inserting `key` as the
    /// canonical instance when none exists yet.
    pub fn intern(&self, key: &K) -> CanonicalKey<K> {
        if let Some(existing) = self.entries.get(key) {
            return CanonicalKey {
                entry: Arc::clone(existing.value()),
            };
        }

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CanonicalEntry {
                    key: key.clone(),
                    monitor: Monitor::new(),
                })
            })
            .value()
            .clone();

        CanonicalKey { entry }
    }

    /// Acquire the monitor for `key` within `timeout`.
    ///
    /// Never fails with an error: contention and timeouts yield `false`.
    /// Each successful call must be balanced by one [`exit`](Self::exit) from
    /// the same thread.
    pub fn try_enter(&self, key: &K, timeout: Duration) -> bool {
        self.try_enter_canonical(key, timeout).is_some()
    }

    /// Like [`try_enter`](Self::try_enter) but also hands back the canonical
    /// instance that was locked.
    pub fn try_enter_canonical(&self, key: &K, timeout: Duration) -> Option<CanonicalKey<K>> {
        let deadline = deadline_after(timeout);
        let mut attempts = 0_u32;

        loop {
            attempts += 1;
            let canonical = self.intern(key);

            if !canonical.entry.monitor.try_enter(deadline) {
                trace!(key = ?key, attempts = attempts, "Key mutex acquisition timed out");
                return None;
            }

            if self.is_current(key, &canonical) {
                return Some(canonical);
            }

            // Trimmed between intern and acquire; this monitor no longer guards the key
            canonical.entry.monitor.exit();
            debug!(
                key = ?key,
                attempts = attempts,
                "Canonical key evicted during acquisition, retrying"
            );

            if deadline_passed(deadline) {
                return None;
            }
        }
    }

    /// Scoped variant of [`try_enter`](Self::try_enter)
    pub fn lock(&self, key: &K, timeout: Duration) -> Option<KeyMutexGuard<K>> {
        self.try_enter_canonical(key, timeout)
            .map(|canonical| KeyMutexGuard {
                canonical,
                _not_send: PhantomData,
            })
    }

    /// Release one level of the monitor for `key`.
    ///
    /// Errors when the key has no canonical entry or the calling thread does
    /// not hold its monitor.
    pub fn exit(&self, key: &K) -> Result<()> {
        let entry = self
            .entries
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KeySyncError::KeyNotInterned {
                key: format!("{key:?}"),
            })?;

        if entry.monitor.exit() {
            Ok(())
        } else {
            Err(KeySyncError::NotLockOwner {
                key: format!("{key:?}"),
            })
        }
    }

    /// Remove every canonical entry that is not currently locked.
    ///
    /// Only one trim runs at a time; acquisitions racing with a trim are
    /// resolved by the re-validation in `try_enter`. Returns the number of
    /// entries removed.
    pub fn trim_excess(&self) -> usize {
        let _trim = self.trim_lock.lock();

        let mut scanned = 0_usize;
        let mut removed = 0_usize;
        self.entries.retain(|_, entry| {
            scanned += 1;
            let keep = entry.monitor.is_locked();
            if !keep {
                removed += 1;
            }
            keep
        });

        log_lock_maintenance("key_mutex", "trim_excess", scanned, removed);
        removed
    }

    /// Whether the current canonical entry for `key` is held by any thread
    pub fn is_locked(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.monitor.is_locked())
            .unwrap_or(false)
    }

    /// Whether the calling thread holds the monitor for `key`
    pub fn is_held_by_current_thread(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.monitor.is_held_by_current_thread())
            .unwrap_or(false)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_current(&self, key: &K, canonical: &CanonicalKey<K>) -> bool {
        self.entries
            .get(key)
            .map(|entry| Arc::ptr_eq(entry.value(), &canonical.entry))
            .unwrap_or(false)
    }
}

impl<K: LockKey> fmt::Debug for KeyMutexRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMutexRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
