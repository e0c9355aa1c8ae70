//! FIFO wait lists used to build blocking synchronization primitives.

use std::collections::VecDeque;
use std::mem;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use derive_more::Display;

use super::task::{Location, Thread, ThreadId, ThreadState};
use super::Scheduler;

static NEXT_WAIT_LIST_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a wait list in a thread's [`Location`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitListId(u64);

/// What a thread on a wait list is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    Lock,
    Condition
}

/// A struct representing that the current thread has been placed on a wait list and needs to be suspended.
///
/// # Panics
///
/// Dropping a value of this type without calling [`ThreadWait::suspend`] panics. The current thread has already been marked as blocked at
/// that point, so continuing to run it would leave the scheduler's state inconsistent.
pub(crate) struct ThreadWait<'a>(&'a Scheduler);

impl<'a> ThreadWait<'a> {
    /// Switches away from the current thread. Returns once the thread has been woken and scheduled again.
    ///
    /// Any locks protecting the wait list must be released before calling this.
    pub fn suspend(self) {
        let sched = self.0;

        mem::forget(self);
        sched.schedule();
    }
}

impl<'a> Drop for ThreadWait<'a> {
    fn drop(&mut self) {
        panic!("Missing call to ThreadWait::suspend after calling WaitList::wait");
    }
}

/// A FIFO list onto which threads can enqueue themselves to be woken up later.
///
/// Wait lists have no lock of their own and are meant to live inside the locked state of the primitive that uses them.
pub(crate) struct WaitList {
    id: Option<WaitListId>,
    kind: WaitKind,
    queue: VecDeque<Rc<Thread>>
}

impl WaitList {
    pub const fn new(kind: WaitKind) -> WaitList {
        WaitList {
            id: None,
            kind,
            queue: VecDeque::new()
        }
    }

    fn id(&mut self) -> WaitListId {
        *self.id.get_or_insert_with(|| WaitListId(NEXT_WAIT_LIST_ID.fetch_add(1, Ordering::Relaxed)))
    }

    fn location(&mut self) -> Location {
        match self.kind {
            WaitKind::Lock => Location::LockWait(self.id()),
            WaitKind::Condition => Location::CondWait(self.id())
        }
    }

    /// Adds the current thread to the end of the wait list and marks it as blocked. Returns a [`ThreadWait`] that must be used to suspend
    /// the current thread after releasing the lock protecting this list.
    ///
    /// If `deadline` passes before the thread is woken, the scheduler wakes it anyway and [`Thread::take_timed_out`] returns `true`. The
    /// thread must then remove itself from the list with [`WaitList::remove`].
    #[must_use]
    pub fn wait<'a>(&mut self, sched: &'a Scheduler, deadline: Option<Instant>) -> ThreadWait<'a> {
        let state = match self.kind {
            WaitKind::Lock => ThreadState::BlockedOnLock,
            WaitKind::Condition => ThreadState::BlockedOnCondition
        };
        let location = self.location();

        self.queue.push_back(sched.block_current(state, location, deadline));
        ThreadWait(sched)
    }

    /// Removes the first thread that is still waiting on this list and makes it runnable.
    pub fn wake_one(&mut self, sched: &Scheduler) -> Option<Rc<Thread>> {
        let location = self.location();

        while let Some(thread) = self.queue.pop_front() {
            if sched.wake(&thread, |loc| loc == location) {
                return Some(thread);
            }
        }

        None
    }

    /// Makes every thread waiting on this list runnable. Returns the number of threads woken.
    pub fn wake_all(&mut self, sched: &Scheduler) -> usize {
        let location = self.location();

        mem::take(&mut self.queue).into_iter().filter(|thread| sched.wake(thread, |loc| loc == location)).count()
    }

    /// Drops the entry for a thread that stopped waiting on its own, e.g. because its deadline passed.
    pub fn remove(&mut self, id: ThreadId) {
        self.queue.retain(|thread| thread.id() != id);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Drop for WaitList {
    fn drop(&mut self) {
        if !self.queue.is_empty() && !std::thread::panicking() {
            log::warn!("Dropped a wait list with {} thread(s) still waiting on it", self.queue.len());
        }
    }
}
