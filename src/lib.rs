#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # KeySync Core
//!
//! Key-scoped concurrency coordination for a single process.
//!
//! ## Overview
//!
//! Three primitives that scope synchronization to a *key value* instead of
//! to an object:
//!
//! - [`KeyMutexRegistry`] - "lock by value": equal keys share one canonical,
//!   re-entrant monitor
//! - [`KeyReadWriteLock`] - per-key shared/exclusive locks with timeouts,
//!   access tracking and idle eviction
//! - [`TaskCoordinator`] - a coalescing, key-serialized background work queue
//!   that optionally runs each item under the key's monitor
//!
//! ## Module Organization
//!
//! - [`sync`] - the two lock registries
//! - [`coordinator`] - the task coordinator, its failure sink and metrics
//! - [`config`] - configuration structs and the YAML/environment loader
//! - [`error`] - structured error handling
//! - [`logging`] - tracing initialisation and structured log helpers
//!
//! ## Error Model
//!
//! Contention is a value, not an error: `try_*` calls return `bool` or
//! `Option`. [`KeySyncError`] is reserved for contract violations (releasing
//! a lock you do not hold, removing a key without its write lock), the
//! timeout of the throwing `acquire_*` helpers, and setup failures.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keysync_core::{
//!     KeyMutexRegistry, KeyReadWriteLock, TaskCoordinator, TaskCoordinatorBuilder,
//!     TaskCoordinatorConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! keysync_core::logging::init_structured_logging();
//!
//! let registry = Arc::new(KeyMutexRegistry::<String>::new());
//! let coordinator: TaskCoordinator<String, Vec<u8>> =
//!     TaskCoordinatorBuilder::new(TaskCoordinatorConfig::default())
//!         .registry(Arc::clone(&registry))
//!         .build()?;
//!
//! coordinator.submit("blob:1".to_string(), |bytes| Ok(!bytes.is_empty()), vec![1, 2, 3], true);
//!
//! let pins = KeyReadWriteLock::<String>::new();
//! let _pinned = pins.acquire_read_lock(&"blob:1".to_string(), Duration::from_secs(1))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod sync;

pub use config::{CoordinationConfig, KeyLockConfig, TaskCoordinatorConfig};
pub use coordinator::{
    CoordinatorMetrics, TaskCoordinator, TaskCoordinatorBuilder, TaskFailure, TaskFailureReason,
    TaskFailureSink, TracingFailureSink,
};
pub use error::{KeySyncError, Result};
pub use sync::{
    CanonicalKey, KeyLockHandle, KeyMutexGuard, KeyMutexRegistry, KeyReadWriteLock, LockMode,
};
