use std::fmt;

use super::spinlock::Spinlock;
use crate::error::{Error, Result};
use crate::sched::task::ThreadId;
use crate::sched::wait::{WaitKind, WaitList};
use crate::sched::Scheduler;

struct MutexInner {
    owner: Option<ThreadId>,
    waiters: WaitList
}

/// A mutual exclusion lock owned by a user thread.
///
/// Threads that find the mutex held block until it is handed to them. Ownership passes directly from the releasing thread to the thread
/// that has waited longest, so waiters acquire the mutex in FIFO order and a releasing thread cannot immediately take it back.
pub struct RawMutex {
    inner: Spinlock<MutexInner>
}

impl RawMutex {
    pub const fn new() -> RawMutex {
        RawMutex {
            inner: Spinlock::const_new(super::spinlock::RawSpinlock::new(), MutexInner {
                owner: None,
                waiters: WaitList::new(WaitKind::Lock)
            })
        }
    }

    /// Acquires the mutex, blocking the current thread while another thread owns it.
    ///
    /// Fails with [`Error::Deadlock`] if the current thread already owns the mutex.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a runtime.
    pub fn acquire(&self) -> Result<()> {
        let sched = Scheduler::current();
        let me = sched.current_thread();

        let wait = {
            let mut inner = self.inner.lock();

            match inner.owner {
                None => {
                    inner.owner = Some(me.id());
                    me.add_held_mutex();
                    return Ok(());
                },
                Some(owner) if owner == me.id() => return Err(Error::Deadlock),
                Some(_) => inner.waiters.wait(&sched, None)
            }
        };

        wait.suspend();

        debug_assert_eq!(Some(me.id()), self.owner());
        me.add_held_mutex();
        Ok(())
    }

    /// Acquires the mutex if no thread owns it. Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a runtime.
    pub fn try_acquire(&self) -> bool {
        let sched = Scheduler::current();
        let me = sched.current_thread();
        let mut inner = self.inner.lock();

        if inner.owner.is_some() {
            return false;
        }

        inner.owner = Some(me.id());
        me.add_held_mutex();
        true
    }

    /// Releases the mutex, handing it to the first waiting thread if there is one.
    ///
    /// Fails with [`Error::OwnershipViolation`] if the current thread does not own the mutex.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a runtime.
    pub fn release(&self) -> Result<()> {
        let sched = Scheduler::current();
        let me = sched.current_thread();
        let mut inner = self.inner.lock();

        if inner.owner != Some(me.id()) {
            log::warn!("{} tried to unlock a mutex it does not own", me.debug_name());
            return Err(Error::OwnershipViolation);
        }

        inner.owner = inner.waiters.wake_one(&sched).map(|thread| thread.id());
        me.remove_held_mutex();
        Ok(())
    }

    /// The thread that owns the mutex. A mutex released with waiters is already owned by the first of them.
    pub fn owner(&self) -> Option<ThreadId> {
        self.inner.lock().owner
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        RawMutex::new()
    }
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RawMutex").field("owner", &self.owner()).finish()
    }
}

unsafe impl lock_api::RawMutex for RawMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawMutex = RawMutex::new();

    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        if let Err(err) = self.acquire() {
            panic!("failed to lock mutex: {}", err);
        }
    }

    fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    unsafe fn unlock(&self) {
        // A guard moved to another user thread fails here; the warning has already been logged.
        let _ = self.release();
    }

    fn is_locked(&self) -> bool {
        RawMutex::is_locked(self)
    }
}

/// A mutex protecting a value of type `T`, locked through a guard.
///
/// # Panics
///
/// Locking a mutex the current thread already holds panics, since it could never succeed.
pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;
