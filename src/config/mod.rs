//! # Coordination Configuration
//!
//! Configuration structures consumed by the key-scoped coordination primitives.
//! Every struct deserializes with defaults for missing fields, so an empty file
//! (or no file at all) yields a working configuration.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keysync_core::config::{ConfigManager, TaskCoordinatorConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Explicit construction
//! let coordinator_config = TaskCoordinatorConfig::default().with_queue_capacity(1_000);
//!
//! // Or load from config/keysync.yaml with environment overlays
//! let manager = ConfigManager::load()?;
//! let lock_timeout = manager.config().task_coordinator.lock_timeout();
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{KeySyncError, Result};

pub use loader::ConfigManager;

/// Root configuration mirroring `keysync.yaml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Background task coordinator settings
    pub task_coordinator: TaskCoordinatorConfig,

    /// Per-key reader/writer lock settings
    pub key_locks: KeyLockConfig,
}

impl CoordinationConfig {
    pub fn validate(&self) -> Result<()> {
        self.task_coordinator.validate()?;
        self.key_locks.validate()
    }
}

/// Task coordinator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskCoordinatorConfig {
    /// Maximum number of pending keys; zero or negative means unbounded
    pub queue_capacity: i64,
    /// Upper bound on the idle wait between worker sweeps
    pub poll_interval_ms: u64,
    /// Time the worker waits for a key mutex before re-queueing the item
    pub lock_timeout_ms: u64,
    /// Budget for the drain performed on shutdown
    pub shutdown_grace_period_ms: u64,
    /// How long shutdown waits for the worker thread to exit
    pub worker_join_timeout_ms: u64,
    /// Wake the worker as soon as work is submitted instead of waiting for the next poll
    pub wake_on_submit: bool,
    /// Prefix for the worker thread name
    pub worker_name: String,
}

impl Default for TaskCoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 0,
            poll_interval_ms: 1_000,
            lock_timeout_ms: 100,
            shutdown_grace_period_ms: 10_000,
            worker_join_timeout_ms: 15_000,
            wake_on_submit: true,
            worker_name: "keysync-coordinator".to_string(),
        }
    }
}

impl TaskCoordinatorConfig {
    /// Capacity as an optional bound
    pub fn capacity(&self) -> Option<usize> {
        if self.queue_capacity <= 0 {
            None
        } else {
            usize::try_from(self.queue_capacity).ok()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }

    /// Set the queue capacity (zero or negative for unbounded)
    pub fn with_queue_capacity(mut self, capacity: i64) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_to_millis(interval);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = duration_to_millis(timeout);
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period_ms = duration_to_millis(grace);
        self
    }

    pub fn with_worker_join_timeout(mut self, timeout: Duration) -> Self {
        self.worker_join_timeout_ms = duration_to_millis(timeout);
        self
    }

    pub fn with_wake_on_submit(mut self, wake: bool) -> Self {
        self.wake_on_submit = wake;
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(KeySyncError::Configuration(
                "task_coordinator.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.worker_name.trim().is_empty() {
            return Err(KeySyncError::Configuration(
                "task_coordinator.worker_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-key reader/writer lock configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyLockConfig {
    /// Timeout used by the `*_default` acquire helpers
    pub default_lock_timeout_ms: u64,
    /// Entries idle for longer than this are eligible for cleanup
    pub idle_threshold_ms: u64,
}

impl Default for KeyLockConfig {
    fn default() -> Self {
        Self {
            default_lock_timeout_ms: 5_000,
            idle_threshold_ms: 300_000,
        }
    }
}

impl KeyLockConfig {
    pub fn default_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.default_lock_timeout_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn with_default_lock_timeout(mut self, timeout: Duration) -> Self {
        self.default_lock_timeout_ms = duration_to_millis(timeout);
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold_ms = duration_to_millis(threshold);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_threshold_ms == 0 {
            return Err(KeySyncError::Configuration(
                "key_locks.idle_threshold_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
