//! Thread control blocks and the thread lifecycle: termination, joining and detaching.

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Instant;

use bitflags::bitflags;
use derive_more::Display;

use super::wait::WaitListId;
use super::Scheduler;
use crate::arch::{SavedContext, Stack};
use crate::error::{Error, Result};
use crate::io::Interest;
use crate::specific::SpecificValues;
use crate::sync::critical::CriticalLock;
use crate::util::fatal;

/// The value a thread produces when its start routine returns or when it calls [`exit`](crate::thread::exit).
pub type ExitValue = Box<dyn Any>;

pub(crate) type StartFn = Box<dyn FnOnce() -> ExitValue>;

/// How a thread ended: with a value, or with the payload of a panic that escaped its start routine.
pub(crate) type ThreadOutcome = core::result::Result<ExitValue, Box<dyn Any + Send>>;

/// An identifier for a thread, unique within its runtime. Identifiers are never reused.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) u64);

/// The scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// The thread is on the run queue waiting for its turn.
    Runnable,
    /// The thread is the one currently executing.
    Running,
    /// The thread is waiting for a mutex or a file descriptor lock.
    BlockedOnLock,
    /// The thread is waiting for another thread to terminate.
    BlockedOnJoin,
    /// The thread is waiting for a file descriptor to become ready.
    BlockedOnIo,
    /// The thread is waiting on a condition variable.
    BlockedOnCondition,
    /// The thread is waiting for one of a set of signals to arrive.
    BlockedOnSignal,
    /// The thread is sleeping until a deadline passes.
    Sleeping,
    /// The thread was created suspended and has not been resumed yet.
    Suspended,
    /// The thread has terminated and will never be joined. Its resources are released.
    TerminatedDetached,
    /// The thread has terminated and its exit value is waiting to be collected by a join.
    TerminatedJoinable
}

impl ThreadState {
    /// Whether the thread has finished running, whether or not it has been joined.
    pub fn is_terminated(self) -> bool {
        matches!(self, ThreadState::TerminatedDetached | ThreadState::TerminatedJoinable)
    }

    /// Whether the thread is waiting for an event before it can run again. Suspended threads wait for an explicit resume instead and are
    /// not counted.
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            ThreadState::BlockedOnLock
                | ThreadState::BlockedOnJoin
                | ThreadState::BlockedOnIo
                | ThreadState::BlockedOnCondition
                | ThreadState::BlockedOnSignal
                | ThreadState::Sleeping
        )
    }
}

/// The one queue a thread is currently on.
///
/// Keeping this in a single field makes it impossible for a thread to be on two queues at once. Queues themselves may still hold stale
/// entries for a thread that was removed by a timeout; those are recognised by the location no longer naming the queue and are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The thread is running, terminated, suspended, or in the middle of a state transition.
    None,
    RunQueue,
    LockWait(WaitListId),
    CondWait(WaitListId),
    JoinWait(ThreadId),
    IoWait(RawFd, Interest),
    FdLockWait(RawFd, Interest),
    PollWait,
    SignalWait,
    Sleep,
    /// The main thread is waiting for every other thread to terminate before the runtime shuts down.
    Drain
}

impl Location {
    pub fn is_waiting(self) -> bool {
        !matches!(self, Location::None | Location::RunQueue)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// The thread will never be joined, so it is released as soon as it terminates.
        const DETACHED = 1 << 0;
        /// The thread that entered the runtime. It runs on the host stack and cannot be joined.
        const MAIN = 1 << 1;
    }
}

pub(crate) struct ThreadInternal {
    pub state: ThreadState,
    pub location: Location,
    pub flags: ThreadFlags,
    pub join_queue: VecDeque<Rc<Thread>>,
    pub outcome: Option<ThreadOutcome>
}

/// A thread control block.
///
/// The scheduler, the wait lists and handles all share thread control blocks through [`Rc`]. Fields that only the thread itself touches
/// while it runs (its start routine, thread-specific values, wait results) live outside of the lock in cells.
pub(crate) struct Thread {
    id: ThreadId,
    name: Option<String>,
    priority: i32,
    internal: CriticalLock<ThreadInternal>,
    context: UnsafeCell<SavedContext>,
    stack: Cell<Option<Stack>>,
    start: Cell<Option<StartFn>>,
    deadline: Cell<Option<Instant>>,
    timed_out: Cell<bool>,
    join_result: Cell<Option<Result<ExitValue>>>,
    slice_start: Cell<Instant>,
    held_mutexes: Cell<usize>,
    pub(crate) specific: RefCell<SpecificValues>
}

impl Thread {
    pub(super) fn new(
        id: ThreadId,
        name: Option<String>,
        priority: i32,
        flags: ThreadFlags,
        context: SavedContext,
        stack: Option<Stack>,
        start: Option<StartFn>
    ) -> Thread {
        Thread {
            id,
            name,
            priority,
            internal: CriticalLock::new(ThreadInternal {
                state: ThreadState::Suspended,
                location: Location::None,
                flags,
                join_queue: VecDeque::new(),
                outcome: None
            }),
            context: UnsafeCell::new(context),
            stack: Cell::new(stack),
            start: Cell::new(start),
            deadline: Cell::new(None),
            timed_out: Cell::new(false),
            join_result: Cell::new(None),
            slice_start: Cell::new(Instant::now()),
            held_mutexes: Cell::new(0),
            specific: RefCell::new(SpecificValues::default())
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn debug_name(&self) -> impl fmt::Display + '_ {
        ThreadDebugName(self)
    }

    /// Locks this thread's scheduling state.
    ///
    /// # Lock Ordering
    ///
    /// The lock is a [`CriticalLock`], so it must never be requested while already held. Holding it while locking the scheduler core or
    /// another (different) thread is fine.
    pub fn lock(&self) -> spin::MutexGuard<ThreadInternal> {
        self.internal.lock()
    }

    pub(super) fn context_ptr(&self) -> *mut SavedContext {
        self.context.get()
    }

    pub(super) fn take_start(&self) -> Option<StartFn> {
        self.start.take()
    }

    /// Frees the thread's stack. Must only be called once the thread can no longer run.
    pub(super) fn release_stack(&self) {
        drop(self.stack.take());
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get()
    }

    pub(super) fn set_deadline(&self, deadline: Option<Instant>) {
        self.deadline.set(deadline);
    }

    /// Returns whether the thread's last wait ended because its deadline passed, clearing the flag.
    pub fn take_timed_out(&self) -> bool {
        self.timed_out.replace(false)
    }

    pub(super) fn set_timed_out(&self) {
        self.timed_out.set(true);
    }

    pub(super) fn slice_start(&self) -> Instant {
        self.slice_start.get()
    }

    pub(super) fn start_slice(&self) {
        self.slice_start.set(Instant::now());
    }

    pub fn held_mutexes(&self) -> usize {
        self.held_mutexes.get()
    }

    pub fn add_held_mutex(&self) {
        self.held_mutexes.set(self.held_mutexes.get() + 1);
    }

    pub fn remove_held_mutex(&self) {
        self.held_mutexes.set(self.held_mutexes.get().saturating_sub(1));
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Thread {}", self.debug_name())
    }
}

struct ThreadDebugName<'a>(&'a Thread);

impl fmt::Display for ThreadDebugName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.name {
            Some(ref name) => write!(f, "(thread {} '{}')", self.0.id, name),
            None => write!(f, "(thread {})", self.0.id)
        }
    }
}

/// Unwinding payload used by [`exit`](crate::thread::exit) to leave a thread's start routine with a value.
pub(crate) struct ExitRequest(pub ExitValue);

// SAFETY: An exit request is only ever caught on the kernel thread that raised it, by the entry point of the same user thread (or by the
//         runtime's entry point for the main thread).
unsafe impl Send for ExitRequest {}

/// Runs a thread's start routine, turning an [`ExitRequest`] unwind into a normal exit value.
pub(crate) fn catch_exit(f: impl FnOnce() -> ExitValue) -> ThreadOutcome {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<ExitRequest>() {
            Ok(request) => Ok(request.0),
            Err(payload) => Err(payload)
        }
    }
}

impl Scheduler {
    /// Records the termination of the current thread. The thread must not run any more user code after this returns.
    ///
    /// If a thread is waiting to join, the first joiner receives the outcome and the thread becomes detached, so every other joiner fails
    /// with [`Error::NoSuchThread`]. Otherwise a joinable thread keeps its outcome until it is joined or detached.
    pub(crate) fn finish_current(&self, outcome: ThreadOutcome) {
        let thread = self.current_thread();

        if thread.held_mutexes() > 0 {
            log::warn!("{} exited while holding {} mutex(es); they remain locked", thread.debug_name(), thread.held_mutexes());
        }

        let mut lost_panic = None;
        let mut woken = Vec::new();

        let released = {
            let mut internal = thread.lock();
            let mut joiners = mem::take(&mut internal.join_queue);

            if internal.flags.contains(ThreadFlags::DETACHED) {
                internal.state = ThreadState::TerminatedDetached;
                lost_panic = outcome.err();
            } else if let Some(joiner) = joiners.pop_front() {
                internal.flags |= ThreadFlags::DETACHED;
                internal.state = ThreadState::TerminatedDetached;
                joiner.join_result.set(Some(outcome.map_err(Error::Panicked)));
                woken.push(joiner);
            } else {
                internal.state = ThreadState::TerminatedJoinable;
                internal.outcome = Some(outcome);
            }

            for joiner in joiners {
                joiner.join_result.set(Some(Err(Error::NoSuchThread)));
                woken.push(joiner);
            }

            internal.location = Location::None;
            internal.state == ThreadState::TerminatedDetached
        };

        let id = thread.id();
        for joiner in woken {
            self.wake(&joiner, |loc| loc == Location::JoinWait(id));
        }

        if let Some(payload) = lost_panic {
            self.record_lost_panic(&thread, payload);
        }

        log::debug!("{} exited", thread.debug_name());

        let drain = {
            let mut core = self.core.lock();

            if released {
                core.threads.remove(&id);
            }

            core.live -= 1;
            core.reap.push(thread);

            if core.live == 1 {
                core.drain.take()
            } else {
                None
            }
        };

        if let Some(main) = drain {
            self.wake(&main, |loc| loc == Location::Drain);
        }
    }

    pub(crate) fn record_lost_panic(&self, thread: &Thread, payload: Box<dyn Any + Send>) {
        log::error!("{} panicked and was never joined", thread.debug_name());

        let mut core = self.core.lock();
        if core.lost_panic.is_none() {
            core.lost_panic = Some(payload);
        }
    }

    /// Waits for a thread to terminate and collects its exit value.
    pub(crate) fn join(&self, id: ThreadId) -> Result<ExitValue> {
        let me = self.current_thread();

        if me.id() == id {
            return Err(Error::Deadlock);
        }

        let target = self.lookup(id).ok_or(Error::NoSuchThread)?;

        {
            let mut internal = target.lock();

            if internal.flags.contains(ThreadFlags::DETACHED) {
                return Err(Error::NoSuchThread);
            }

            if internal.state == ThreadState::TerminatedJoinable {
                let outcome = internal.outcome.take();

                internal.flags |= ThreadFlags::DETACHED;
                internal.state = ThreadState::TerminatedDetached;
                drop(internal);

                self.core.lock().threads.remove(&id);
                log::debug!("{} collected {}", me.debug_name(), target.debug_name());

                return match outcome {
                    Some(outcome) => outcome.map_err(Error::Panicked),
                    None => fatal!("{} terminated without an outcome", target.debug_name())
                };
            }

            internal.join_queue.push_back(self.block_current(ThreadState::BlockedOnJoin, Location::JoinWait(id), None));
        }

        drop(target);
        self.schedule();

        me.join_result.take().unwrap_or(Err(Error::NoSuchThread))
    }

    /// Marks a thread as detached, releasing it at once if it has already terminated. Threads waiting to join it fail with
    /// [`Error::NoSuchThread`].
    pub(crate) fn detach(&self, id: ThreadId) -> Result<()> {
        let target = self.lookup(id).ok_or(Error::NoSuchThread)?;

        let (joiners, released, lost_panic) = {
            let mut internal = target.lock();

            if internal.flags.contains(ThreadFlags::DETACHED) {
                return Err(Error::NoSuchThread);
            }

            internal.flags |= ThreadFlags::DETACHED;

            let joiners = mem::take(&mut internal.join_queue);

            if internal.state == ThreadState::TerminatedJoinable {
                internal.state = ThreadState::TerminatedDetached;
                (joiners, true, internal.outcome.take().and_then(|outcome| outcome.err()))
            } else {
                (joiners, false, None)
            }
        };

        for joiner in joiners {
            joiner.join_result.set(Some(Err(Error::NoSuchThread)));
            self.wake(&joiner, |loc| loc == Location::JoinWait(id));
        }

        if released {
            self.core.lock().threads.remove(&id);
        }

        if let Some(payload) = lost_panic {
            self.record_lost_panic(&target, payload);
        }

        log::debug!("detached {}", target.debug_name());
        Ok(())
    }

    /// Makes a thread that was created suspended runnable. Does nothing for threads that are not suspended.
    pub(crate) fn resume(&self, id: ThreadId) -> Result<()> {
        let target = self.lookup(id).ok_or(Error::NoSuchThread)?;

        if target.lock().state == ThreadState::Suspended {
            self.core.lock().enqueue(&target);
        }

        Ok(())
    }

    pub(crate) fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.lookup(id).map(|thread| thread.lock().state)
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;
    use crate::test_util;
    use crate::thread::{self, ThreadAttr};

    #[test]
    fn test_join_value() {
        test_util::run(|| {
            let child = thread::spawn(|| 0x12345678usize).unwrap();

            assert_eq!(0x12345678, child.join().unwrap());
            assert!(matches!(child.join(), Err(Error::NoSuchThread)));
            assert!(matches!(child.detach(), Err(Error::NoSuchThread)));
        });
    }

    #[test]
    fn test_join_terminated() {
        test_util::run(|| {
            let child = thread::spawn(|| 7).unwrap();

            thread::yield_now();
            assert_eq!(Some(ThreadState::TerminatedJoinable), child.thread().state());
            assert_eq!(7, child.join().unwrap());
            assert_eq!(None, child.thread().state());
        });
    }

    #[test]
    fn test_join_self() {
        test_util::run(|| {
            assert!(matches!(thread::current().join(), Err(Error::Deadlock)));

            let child = thread::spawn(|| thread::current().join().err().map(|err| err.errno())).unwrap();
            assert_eq!(Some(libc::EDEADLK), child.join().unwrap());
        });
    }

    #[test]
    fn test_second_joiner() {
        test_util::run(|| {
            let order = Rc::new(AtomicI32::new(0));
            let target = thread::spawn(|| {
                thread::yield_now();
                thread::yield_now();
                "done"
            })
            .unwrap();
            let handle = target.thread();

            let second = thread::spawn(move || matches!(handle.join(), Err(Error::NoSuchThread))).unwrap();

            {
                let order = order.clone();
                thread::spawn(move || order.store(1, Ordering::Relaxed)).unwrap().detach().unwrap();
            }

            assert_eq!("done", target.join().unwrap());
            assert!(second.join().unwrap());
            assert_eq!(1, order.load(Ordering::Relaxed));
        });
    }

    #[test]
    fn test_detach_running() {
        test_util::run(|| {
            let flag = Rc::new(AtomicI32::new(0));
            let child = {
                let flag = flag.clone();
                thread::spawn(move || {
                    thread::yield_now();
                    flag.store(1, Ordering::Relaxed);
                })
                .unwrap()
            };

            child.detach().unwrap();
            assert!(matches!(child.join(), Err(Error::NoSuchThread)));
            assert!(matches!(child.detach(), Err(Error::NoSuchThread)));

            thread::yield_now();
            thread::yield_now();
            assert_eq!(1, flag.load(Ordering::Relaxed));
            assert_eq!(None, child.thread().state());
        });
    }

    #[test]
    fn test_detach_terminated() {
        test_util::run(|| {
            let child = thread::spawn(|| ()).unwrap();

            thread::yield_now();
            assert_eq!(Some(ThreadState::TerminatedJoinable), child.thread().state());
            child.detach().unwrap();
            assert_eq!(None, child.thread().state());
        });
    }

    #[test]
    fn test_exit() {
        test_util::run(|| {
            let child = thread::spawn(|| -> u32 {
                thread::exit(42u32);
            })
            .unwrap();

            assert_eq!(42, child.join().unwrap());
        });
    }

    #[test]
    fn test_panic_join() {
        test_util::run(|| {
            let child = thread::spawn(|| panic!("expected panic")).unwrap();

            match child.join() {
                Err(Error::Panicked(payload)) => assert_eq!(Some(&"expected panic"), payload.downcast_ref::<&str>()),
                _ => panic!("join should report the panic")
            }
        });
    }

    #[test]
    fn test_suspended() {
        test_util::run(|| {
            let flag = Rc::new(AtomicI32::new(0));
            let mut attr = ThreadAttr::new();
            attr.set_create_suspended(true);

            let child = {
                let flag = flag.clone();
                attr.spawn(move || flag.store(1, Ordering::Relaxed)).unwrap()
            };

            thread::yield_now();
            assert_eq!(0, flag.load(Ordering::Relaxed));
            assert_eq!(Some(ThreadState::Suspended), child.thread().state());

            child.thread().resume().unwrap();
            child.join().unwrap();
            assert_eq!(1, flag.load(Ordering::Relaxed));
        });
    }

    #[test]
    fn test_states() {
        test_util::run(|| {
            let child = thread::spawn(|| thread::yield_now()).unwrap();

            assert_eq!(Some(ThreadState::Runnable), child.thread().state());
            assert_eq!(Some(ThreadState::Running), thread::current().state());
            child.join().unwrap();
        });
    }
}
