//! Re-entrant, owner-tracked monitor backing each canonical key.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Instant;

use super::wait_until;

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A mutex whose ownership is tied to a thread rather than to a guard, so it
/// can be released by key (`KeyMutexRegistry::exit`) as well as by RAII.
#[derive(Debug, Default)]
pub(crate) struct Monitor {
    state: Mutex<MonitorState>,
    released: Condvar,
}

impl Monitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enter the monitor, waiting until `deadline` (`None` waits forever).
    /// The owning thread may enter again without blocking.
    pub(crate) fn try_enter(&self, deadline: Option<Instant>) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return true;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return true;
                }
                Some(_) => {
                    if !wait_until(&self.released, &mut state, deadline) {
                        // Lost the wait, but the owner may have left right at the deadline
                        if state.owner.is_none() {
                            state.owner = Some(me);
                            state.depth = 1;
                            return true;
                        }
                        return false;
                    }
                }
            }
        }
    }

    /// Leave the monitor once. Returns `false` when the calling thread does
    /// not own it.
    pub(crate) fn exit(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner != Some(me) {
            return false;
        }

        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
        true
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub(crate) fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}
