//! Counters describing what a coordinator has done since it started.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of coordinator activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorMetrics {
    /// Submissions accepted (new items and coalesced replacements)
    pub submitted: u64,
    /// Submissions that replaced a still-pending item
    pub coalesced: u64,
    /// Submissions refused because of shutdown or capacity
    pub rejected: u64,
    /// Bodies invoked
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Items put back because the key mutex was busy
    pub lock_retries: u64,
    /// Retries dropped because a newer submission already held the slot
    pub superseded_retries: u64,
    /// Pending items at snapshot time
    pub pending: u64,
}

impl CoordinatorMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.executed == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.executed as f64
    }
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    submitted: AtomicU64,
    coalesced: AtomicU64,
    rejected: AtomicU64,
    executed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    lock_retries: AtomicU64,
    superseded_retries: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn submitted(&self, coalesced: bool) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if coalesced {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn executed(&self, success: bool) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn lock_retry(&self) {
        self.lock_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn superseded_retry(&self) {
        self.superseded_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, pending: usize) -> CoordinatorMetrics {
        CoordinatorMetrics {
            submitted: self.submitted.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            lock_retries: self.lock_retries.load(Ordering::Relaxed),
            superseded_retries: self.superseded_retries.load(Ordering::Relaxed),
            pending: pending as u64,
        }
    }
}
