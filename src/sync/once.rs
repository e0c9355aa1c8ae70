use std::sync::atomic::{AtomicU8, Ordering};

use crate::sched::{self, Scheduler};

const INCOMPLETE: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETE: u8 = 2;

/// Puts a `Once` back to incomplete if its initializer unwinds.
struct ResetOnUnwind<'a>(&'a AtomicU8);

impl Drop for ResetOnUnwind<'_> {
    fn drop(&mut self) {
        self.0.store(INCOMPLETE, Ordering::Release);
    }
}

/// Runs an initializer exactly once, even when the `Once` is shared by runtimes on different OS threads.
///
/// Within a runtime, callers are serialized by a mutex shared by every `Once` of the runtime, so the initializer may block or yield, but
/// must not itself call [`Once::call_once`]. A caller that finds the initializer running in another runtime or outside any runtime yields
/// until it finishes.
#[derive(Debug)]
pub struct Once {
    state: AtomicU8
}

impl Once {
    pub const fn new() -> Once {
        Once {
            state: AtomicU8::new(INCOMPLETE)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }

    /// Runs `f` if no call to `call_once` on this `Once` has completed yet. Callers that arrive while `f` is running wait for it.
    ///
    /// If `f` panics, the `Once` stays incomplete and a later call runs its initializer.
    ///
    /// # Panics
    ///
    /// Panics if `f` calls `call_once` on any `Once` while running inside a runtime, since that would relock the runtime's once mutex.
    pub fn call_once(&self, f: impl FnOnce()) {
        if self.is_completed() {
            return;
        }

        let sched = Scheduler::try_current();
        let _guard = sched.as_ref().map(|sched| sched.once_lock.lock());

        loop {
            match self.state.compare_exchange(INCOMPLETE, RUNNING, Ordering::Acquire, Ordering::Acquire) {
                Ok(_) => break,
                Err(COMPLETE) => return,
                Err(_) => sched::relax()
            }
        }

        let reset = ResetOnUnwind(&self.state);
        f();
        std::mem::forget(reset);

        self.state.store(COMPLETE, Ordering::Release);
    }
}

impl Default for Once {
    fn default() -> Self {
        Once::new()
    }
}
