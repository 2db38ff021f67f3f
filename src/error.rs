use std::time::Duration;

/// Errors surfaced by the key-scoped coordination primitives.
///
/// Contention is never reported through this type on the `try_*` surface;
/// those calls return `bool`/`Option` instead. Variants here are either
/// caller contract violations, the timeout of a throwing convenience API,
/// or setup failures.
#[derive(Debug, thiserror::Error)]
pub enum KeySyncError {
    /// `exit` was called for a key that has no canonical entry
    #[error("Key is not interned: {key}")]
    KeyNotInterned { key: String },

    /// A monitor was released by a thread that does not own it
    #[error("Lock for key {key} is not held by the current thread")]
    NotLockOwner { key: String },

    /// `remove_key` was called without holding the key's write lock
    #[error("Write lock for key {key} must be held to remove it")]
    WriteLockNotHeld { key: String },

    /// The current thread holds a read lock and asked for the write lock
    #[error("Cannot upgrade read lock to write lock for key {key}")]
    LockUpgradeNotSupported { key: String },

    /// A throwing acquire ran out of time
    #[error("Timed out after {timeout:?} acquiring {mode} lock for key {key}")]
    LockTimeout {
        key: String,
        mode: &'static str,
        timeout: Duration,
    },

    /// The background worker thread could not be started
    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<config::ConfigError> for KeySyncError {
    fn from(err: config::ConfigError) -> Self {
        KeySyncError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeySyncError>;
