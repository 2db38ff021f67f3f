//! # Key-Scoped Locking
//!
//! Lock registries that scope mutual exclusion to a *value* rather than to an
//! object: any two keys that compare equal share the same lock.
//!
//! ## Key Components
//!
//! - [`KeyMutexRegistry`] - interns equal keys to one canonical, re-entrant monitor
//! - [`KeyReadWriteLock`] - per-key shared/exclusive locks with idle eviction
//!
//! Both registries are plain shared state backed by [`dashmap::DashMap`]; they
//! own no threads. Lock state is created lazily on first use and may be
//! removed again (`trim_excess`, `remove_key`, `cleanup_unused_locks`), so lock
//! *identity* for a key can change over time. Acquisition paths re-validate the
//! state they locked against the registry and retry transparently when it was
//! evicted underneath them.

pub mod key_mutex;
pub mod key_rw_lock;
mod monitor;

use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

pub use key_mutex::{CanonicalKey, KeyMutexGuard, KeyMutexRegistry};
pub use key_rw_lock::{KeyLockHandle, KeyReadWriteLock, LockMode};

/// Bounds required of anything used as a registry key
pub trait LockKey: Eq + std::hash::Hash + Clone + std::fmt::Debug + Send + Sync + 'static {}

impl<T> LockKey for T where
    T: Eq + std::hash::Hash + Clone + std::fmt::Debug + Send + Sync + 'static
{
}

/// `None` means the timeout is too large to represent and the wait is unbounded
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

pub(crate) fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Wait on `condvar` until notified or the deadline passes.
///
/// Returns `false` without waiting when the deadline has already passed, and
/// `false` after a timed-out wait.
pub(crate) fn wait_until<T>(
    condvar: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        Some(deadline) => {
            if Instant::now() >= deadline {
                return false;
            }
            !condvar.wait_until(guard, deadline).timed_out()
        }
        None => {
            condvar.wait(guard);
            true
        }
    }
}
