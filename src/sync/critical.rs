//! Locks for the runtime's own bookkeeping.
//!
//! The run queue, thread control blocks, the file table and the key table are only ever locked for short critical sections that never
//! switch to another thread. Since there is only one kernel thread, such a lock can never legitimately be found held: if it is, a
//! critical section was re-entered (or a context switch happened inside one) and the scheduler's state can no longer be trusted. A
//! [`CriticalLock`] therefore never waits. Finding it held aborts the process.

use crate::util::fatal;

pub(crate) struct CriticalLock<T>(spin::Mutex<T>);

impl<T> CriticalLock<T> {
    pub const fn new(val: T) -> CriticalLock<T> {
        CriticalLock(spin::Mutex::new(val))
    }

    #[track_caller]
    pub fn lock(&self) -> spin::MutexGuard<T> {
        match self.0.try_lock() {
            Some(guard) => guard,
            None => fatal!("critical section re-entered at {}", std::panic::Location::caller())
        }
    }

    pub fn try_lock(&self) -> Option<spin::MutexGuard<T>> {
        self.0.try_lock()
    }

    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut *self.lock())
    }

    pub fn is_locked(&self) -> bool {
        self.0.is_locked()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lock() {
        let lock = CriticalLock::new(5);

        {
            let guard = lock.lock();
            assert_eq!(5, *guard);
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
        }

        assert_eq!(6, lock.with_lock(|val| {
            *val += 1;
            *val
        }));
        assert!(!lock.is_locked());
    }
}
