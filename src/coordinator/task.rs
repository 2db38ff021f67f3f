//! Task items held in the coordinator's pending map.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use super::sink::TaskFailureReason;

/// Unit of work run by the coordinator. `Ok(true)` is success; `Ok(false)`,
/// an error, or a panic count as failure.
pub type TaskBody<P> = Box<dyn FnOnce(P) -> anyhow::Result<bool> + Send + 'static>;

/// A pending unit of work for one key
pub(crate) struct TaskItem<P> {
    body: TaskBody<P>,
    payload: P,
    pub(crate) needs_lock: bool,
    pub(crate) enqueue_time: Instant,
}

impl<P> TaskItem<P> {
    pub(crate) fn new(body: TaskBody<P>, payload: P, needs_lock: bool) -> Self {
        Self {
            body,
            payload,
            needs_lock,
            enqueue_time: Instant::now(),
        }
    }

    /// Replace body, payload and lock requirement in place. The original
    /// enqueue time is kept.
    pub(crate) fn coalesce(&mut self, newer: TaskItem<P>) {
        self.body = newer.body;
        self.payload = newer.payload;
        self.needs_lock = newer.needs_lock;
    }

    pub(crate) fn queued_for(&self) -> Duration {
        self.enqueue_time.elapsed()
    }

    /// Run the body, converting errors and panics into a failure reason
    pub(crate) fn run(self) -> Result<(), TaskFailureReason> {
        let TaskItem { body, payload, .. } = self;

        match panic::catch_unwind(AssertUnwindSafe(move || body(payload))) {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(TaskFailureReason::ReturnedFalse),
            Ok(Err(err)) => Err(TaskFailureReason::Error(format!("{err:#}"))),
            Err(panic) => Err(TaskFailureReason::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
