//! Shared helpers for the integration test binaries.
#![allow(dead_code)]

pub mod strategies;

use keysync_core::TaskCoordinatorConfig;
use std::sync::Once;
use std::time::Duration;

static INIT_LOGGING: Once = Once::new();

/// Install a test subscriber once per binary. Output is captured by the test
/// harness and only shown for failing tests.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Worker that reacts to submissions immediately
pub fn responsive_config() -> TaskCoordinatorConfig {
    TaskCoordinatorConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_lock_timeout(Duration::from_millis(10))
        .with_shutdown_grace_period(Duration::from_secs(5))
}

/// Worker that only runs on its (long) poll, so tests drive execution with
/// `process_all`
pub fn manual_config() -> TaskCoordinatorConfig {
    TaskCoordinatorConfig::default()
        .with_wake_on_submit(false)
        .with_poll_interval(Duration::from_secs(60))
        .with_lock_timeout(Duration::from_millis(10))
        .with_shutdown_grace_period(Duration::from_secs(5))
}
