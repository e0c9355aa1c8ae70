use std::time::{Duration, Instant};

use super::mutex::MutexGuard;
use super::spinlock::Spinlock;
use crate::sched::wait::{WaitKind, WaitList};
use crate::sched::Scheduler;

/// Whether a timed wait on a [`Condvar`] returned because its timeout elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

/// A condition variable. Waiting threads are woken in the order they started waiting.
///
/// Notifications are not remembered: a notification with no thread waiting is lost.
pub struct Condvar {
    waiters: Spinlock<WaitList>
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            waiters: Spinlock::const_new(super::spinlock::RawSpinlock::new(), WaitList::new(WaitKind::Condition))
        }
    }

    /// Releases the mutex locked by `guard` and blocks until notified, then locks the mutex again before returning.
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.wait_until(guard, None);
    }

    /// Like [`Condvar::wait`], but returns once `timeout` has elapsed even if no notification arrived.
    pub fn wait_timeout<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> WaitTimeoutResult {
        WaitTimeoutResult(self.wait_until(guard, Instant::now().checked_add(timeout)))
    }

    fn wait_until<T>(&self, guard: &mut MutexGuard<'_, T>, deadline: Option<Instant>) -> bool {
        let sched = Scheduler::current();
        // SAFETY: The guard proves the mutex is held by the current thread, and it is locked again before the guard can be used.
        let mutex = unsafe { MutexGuard::mutex(guard).raw() };

        // Releasing never switches threads, so no notification can slip in before this thread is queued.
        if let Err(err) = mutex.release() {
            panic!("condition variable waited on with an unowned mutex: {}", err);
        }

        let wait = self.waiters.lock().wait(&sched, deadline);
        wait.suspend();

        let me = sched.current_thread();
        let timed_out = me.take_timed_out();

        if timed_out {
            self.waiters.lock().remove(me.id());
        }

        if let Err(err) = mutex.acquire() {
            panic!("failed to relock mutex after waiting: {}", err);
        }

        timed_out
    }

    /// Wakes the thread that has waited longest. Returns whether a thread was woken.
    pub fn notify_one(&self) -> bool {
        self.waiters.lock().wake_one(&Scheduler::current()).is_some()
    }

    /// Wakes every waiting thread. Returns the number of threads woken.
    pub fn notify_all(&self) -> usize {
        self.waiters.lock().wake_all(&Scheduler::current())
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Condvar::new()
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::sync::Mutex;
    use crate::test_util;
    use crate::thread;

    #[test]
    fn test_notify_order() {
        test_util::run(|| {
            let state = Rc::new((Mutex::new(Vec::new()), Condvar::new()));

            let children: Vec<_> = (0..3)
                .map(|i| {
                    let state = state.clone();
                    thread::spawn(move || {
                        let mut guard = state.0.lock();

                        state.1.wait(&mut guard);
                        guard.push(i);
                    })
                    .unwrap()
                })
                .collect();

            thread::yield_now();

            assert!(state.1.notify_one());
            assert!(state.1.notify_one());
            assert!(state.1.notify_one());
            assert!(!state.1.notify_one());

            for child in children {
                child.join().unwrap();
            }

            assert_eq!(vec![0, 1, 2], *state.0.lock());
        });
    }

    #[test]
    fn test_notify_all() {
        test_util::run(|| {
            let state = Rc::new((Mutex::new(false), Condvar::new()));
            let woken = Rc::new(RefCell::new(0));

            let children: Vec<_> = (0..4)
                .map(|_| {
                    let state = state.clone();
                    let woken = woken.clone();
                    thread::spawn(move || {
                        let mut ready = state.0.lock();

                        while !*ready {
                            state.1.wait(&mut ready);
                        }

                        *woken.borrow_mut() += 1;
                    })
                    .unwrap()
                })
                .collect();

            thread::yield_now();
            *state.0.lock() = true;
            assert_eq!(4, state.1.notify_all());

            for child in children {
                child.join().unwrap();
            }

            assert_eq!(4, *woken.borrow());
        });
    }

    #[test]
    fn test_wait_timeout() {
        test_util::run(|| {
            let mutex = Mutex::new(());
            let condvar = Condvar::new();
            let mut guard = mutex.lock();

            let start = Instant::now();
            assert!(condvar.wait_timeout(&mut guard, Duration::from_millis(10)).timed_out());
            assert!(start.elapsed() >= Duration::from_millis(10));
            assert!(!condvar.notify_one());
            assert!(mutex.is_locked());
        });
    }

    #[test]
    fn test_wait_timeout_notified() {
        test_util::run(|| {
            let state = Rc::new((Mutex::new(0), Condvar::new()));

            let child = {
                let state = state.clone();
                thread::spawn(move || {
                    let mut guard = state.0.lock();
                    let result = state.1.wait_timeout(&mut guard, Duration::from_secs(10));

                    (result.timed_out(), *guard)
                })
                .unwrap()
            };

            thread::yield_now();
            *state.0.lock() = 5;
            state.1.notify_one();

            assert_eq!((false, 5), child.join().unwrap());
        });
    }
}
