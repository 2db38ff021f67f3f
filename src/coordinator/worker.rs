//! Dedicated worker thread for a coordinator.
//!
//! The loop idles until a submission wakes it or the poll interval passes,
//! then sweeps the pending map. Disconnecting the shutdown channel ends it.
//! On shutdown it drains within the configured grace period before exiting.

use crossbeam::channel::{self, select, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::queue::CoordinatorShared;
use crate::error::Result;
use crate::sync::LockKey;

/// Owning side of a running worker thread
pub(crate) struct WorkerHandle {
    thread: JoinHandle<()>,
    /// Dropping this sender is the cancellation signal
    shutdown_tx: Sender<()>,
    /// Disconnects when the worker thread exits, however it exits
    done_rx: Receiver<()>,
}

impl WorkerHandle {
    pub(crate) fn spawn<K: LockKey, P: Send + 'static>(
        shared: Arc<CoordinatorShared<K, P>>,
        wake_rx: Receiver<()>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);

        let short_id: String = shared.id.simple().to_string().chars().take(8).collect();
        let name = format!("{}-{}", shared.config.worker_name, short_id);

        let thread = thread::Builder::new().name(name).spawn(move || {
            let _done = done_tx;
            run_worker(&shared, &wake_rx, &shutdown_rx);
        })?;

        Ok(Self {
            thread,
            shutdown_tx,
            done_rx,
        })
    }

    /// Signal cancellation and wait up to `join_timeout` for the thread to
    /// finish. Returns `false` when the thread was left running.
    pub(crate) fn stop(self, join_timeout: Duration) -> bool {
        let WorkerHandle {
            thread,
            shutdown_tx,
            done_rx,
        } = self;
        drop(shutdown_tx);

        match done_rx.recv_timeout(join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    error!("Coordinator worker thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    join_timeout_ms = join_timeout.as_millis() as u64,
                    "Coordinator worker did not stop in time; detaching"
                );
                false
            }
        }
    }
}

fn run_worker<K: LockKey, P: Send + 'static>(
    shared: &CoordinatorShared<K, P>,
    wake_rx: &Receiver<()>,
    shutdown_rx: &Receiver<()>,
) {
    let poll_interval = shared.config.poll_interval();
    info!(
        coordinator_id = %shared.id,
        poll_interval_ms = poll_interval.as_millis() as u64,
        "🚀 COORDINATOR: Worker started"
    );

    loop {
        select! {
            recv(wake_rx) -> msg => {
                if msg.is_err() {
                    break;
                }
            }
            recv(shutdown_rx) -> _ => break,
            default(poll_interval) => {}
        }

        if shared.is_shut_down() {
            break;
        }

        if let Some(stats) = shared.sweep_once() {
            if stats.executed > 0 || stats.requeued > 0 {
                debug!(
                    coordinator_id = %shared.id,
                    executed = stats.executed,
                    requeued = stats.requeued,
                    "Sweep finished"
                );
            }
        }
    }

    let grace = shared.config.shutdown_grace_period();
    let drained = shared.drain(grace);
    if drained {
        info!(coordinator_id = %shared.id, "🛑 COORDINATOR: Worker drained and stopped");
    } else {
        warn!(
            coordinator_id = %shared.id,
            remaining = shared.count(),
            grace_ms = grace.as_millis() as u64,
            "COORDINATOR: Worker stopped before the queue was drained"
        );
    }
}
