//! The atomic test-and-set lock that every other primitive is built on.
//!
//! Since all user threads share a single kernel thread, a thread that finds the lock held cannot simply spin: the holder will never get a
//! chance to run and release it. Contended acquisitions instead yield to the scheduler between attempts. Outside of a runtime (e.g. when
//! the lock is shared between OS threads) contention falls back to an ordinary spin loop.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::sched;

/// A single-word lock built on an atomic swap.
#[derive(Debug)]
pub struct RawSpinlock {
    locked: AtomicBool
}

impl RawSpinlock {
    pub const fn new() -> RawSpinlock {
        RawSpinlock {
            locked: AtomicBool::new(false)
        }
    }

    /// Atomically sets the lock and returns `true` if it was previously clear.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    /// Acquires the lock, yielding to other user threads while it is held elsewhere.
    pub fn acquire(&self) {
        while !self.try_acquire() {
            sched::relax();
        }
    }

    /// Clears the lock. Writes made while holding the lock are visible to the next thread that acquires it.
    #[inline]
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        RawSpinlock::new()
    }
}

unsafe impl lock_api::RawMutex for RawSpinlock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawSpinlock = RawSpinlock::new();

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        self.acquire();
    }

    fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    unsafe fn unlock(&self) {
        self.release();
    }

    fn is_locked(&self) -> bool {
        RawSpinlock::is_locked(self)
    }
}

/// A spinlock protecting a value of type `T`. It may be held across yield points: other threads contending for it yield until it is
/// released.
pub type Spinlock<T> = lock_api::Mutex<RawSpinlock, T>;
pub type SpinlockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinlock, T>;

#[cfg(test)]
mod test {
    use std::rc::Rc;
    use std::sync::atomic::AtomicI32;

    use super::*;
    use crate::test_util;
    use crate::thread;

    #[test]
    fn test_try_acquire() {
        let lock = RawSpinlock::new();

        assert!(lock.try_acquire());
        assert!(lock.is_locked());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire());
    }

    #[test]
    fn test_uncontended_outside_runtime() {
        let lock = Spinlock::new(1);

        *lock.lock() += 1;
        assert_eq!(2, *lock.lock());
    }

    #[test]
    fn test_contended_yields() {
        test_util::run(|| {
            let lock = Rc::new(Spinlock::new(0));
            let progress = Rc::new(AtomicI32::new(0));

            let holder = {
                let lock = lock.clone();
                let progress = progress.clone();
                thread::spawn(move || {
                    let mut guard = lock.lock();
                    progress.store(1, Ordering::Relaxed);
                    thread::yield_now();
                    thread::yield_now();
                    *guard += 1;
                })
                .unwrap()
            };

            let waiter = {
                let lock = lock.clone();
                let progress = progress.clone();
                thread::spawn(move || {
                    assert_eq!(1, progress.load(Ordering::Relaxed));
                    let mut guard = lock.lock();
                    assert_eq!(1, *guard);
                    *guard += 1;
                })
                .unwrap()
            };

            holder.join().unwrap();
            waiter.join().unwrap();
            assert_eq!(2, *lock.lock());
        });
    }
}
