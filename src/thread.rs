//! Creating, joining and controlling user threads.

use std::marker::PhantomData;
use std::panic;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::options;
use crate::runtime::MIN_STACK_SIZE;
use crate::sched::task::ExitRequest;
use crate::sched::Scheduler;

pub use crate::sched::task::{ExitValue, ThreadId, ThreadState};

pub const DEFAULT_PRIORITY: i32 = 64;
pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 126;

/// The required alignment of a caller-provided stack.
pub const STACK_ALIGN: usize = 16;

/// Attributes used to create a thread.
#[derive(Debug, Clone)]
pub struct ThreadAttr {
    stack_size: usize,
    stack_address: Option<NonNull<u8>>,
    detached: bool,
    suspended: bool,
    priority: i32,
    name: Option<String>
}

impl ThreadAttr {
    /// Creates attributes with the default stack size of the current runtime (or of the environment's options outside of one), a
    /// joinable thread and the default priority.
    pub fn new() -> ThreadAttr {
        let stack_size = match Scheduler::try_current() {
            Some(sched) => sched.config().stack_size,
            None => options::config().stack_size
        };

        ThreadAttr {
            stack_size,
            stack_address: None,
            detached: false,
            suspended: false,
            priority: DEFAULT_PRIORITY,
            name: None
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Sets the size of the stack. Sizes below [`MIN_STACK_SIZE`] are rejected and leave the attributes unchanged.
    pub fn set_stack_size(&mut self, size: usize) -> Result<()> {
        if size < MIN_STACK_SIZE {
            return Err(Error::InvalidArgument);
        }

        self.stack_size = size;
        Ok(())
    }

    pub fn stack_address(&self) -> Option<NonNull<u8>> {
        self.stack_address
    }

    /// Makes threads created with these attributes run on caller-provided memory starting at `addr` and extending for the configured
    /// stack size. The memory is never freed by the runtime.
    ///
    /// # Safety
    ///
    /// The memory must stay valid, and must not be used for anything else, until every thread created with these attributes has
    /// terminated and been joined or detached.
    pub unsafe fn set_stack_address(&mut self, addr: NonNull<u8>) -> Result<()> {
        if addr.as_ptr() as usize % STACK_ALIGN != 0 {
            return Err(Error::InvalidArgument);
        }

        self.stack_address = Some(addr);
        Ok(())
    }

    pub fn detached(&self) -> bool {
        self.detached
    }

    pub fn set_detached(&mut self, detached: bool) -> &mut Self {
        self.detached = detached;
        self
    }

    pub fn create_suspended(&self) -> bool {
        self.suspended
    }

    /// Makes threads start in the [`ThreadState::Suspended`] state. They do not run until [`ThreadHandle::resume`] is called.
    pub fn set_create_suspended(&mut self, suspended: bool) -> &mut Self {
        self.suspended = suspended;
        self
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Sets the priority recorded for the thread. Scheduling is round-robin regardless of priority.
    pub fn set_priority(&mut self, priority: i32) -> Result<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(Error::InvalidArgument);
        }

        self.priority = priority;
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Creates a thread running `f` in the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a runtime.
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static
    {
        let id = Scheduler::current().spawn(self, Box::new(move || Box::new(f()) as ExitValue))?;

        Ok(JoinHandle {
            thread: ThreadHandle(id),
            _value: PhantomData
        })
    }
}

impl Default for ThreadAttr {
    fn default() -> Self {
        ThreadAttr::new()
    }
}

/// A handle to a thread whose exit value has type `T`.
#[derive(Debug)]
pub struct JoinHandle<T> {
    thread: ThreadHandle,
    _value: PhantomData<fn() -> T>
}

impl<T: 'static> JoinHandle<T> {
    /// Waits for the thread to terminate and returns the value it produced.
    ///
    /// Fails with [`Error::Panicked`] if the thread panicked, and with [`Error::InvalidArgument`] if it called [`exit`] with a value of a
    /// type other than `T`.
    pub fn join(&self) -> Result<T> {
        let value = self.thread.join()?;

        match value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => Err(Error::InvalidArgument)
        }
    }

    /// Detaches the thread. The value it returns is dropped, and later joins fail with [`Error::NoSuchThread`].
    pub fn detach(&self) -> Result<()> {
        self.thread.detach()
    }

    pub fn thread(&self) -> ThreadHandle {
        self.thread
    }
}

/// An untyped handle to a thread of the current runtime.
///
/// Every method except [`ThreadHandle::id`] looks the thread up in the runtime running on the calling OS thread, and panics if there is
/// none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(ThreadId);

impl ThreadHandle {
    pub fn id(self) -> ThreadId {
        self.0
    }

    /// Waits for the thread to terminate and returns its exit value.
    ///
    /// Only one joiner receives the value: once it has been collected, or if the thread is detached, this fails with
    /// [`Error::NoSuchThread`]. A thread joining itself fails with [`Error::Deadlock`].
    pub fn join(self) -> Result<ExitValue> {
        Scheduler::current().join(self.0)
    }

    /// Detaches the thread so its resources are released as soon as it terminates.
    pub fn detach(self) -> Result<()> {
        Scheduler::current().detach(self.0)
    }

    /// Makes a thread that was created suspended runnable.
    pub fn resume(self) -> Result<()> {
        Scheduler::current().resume(self.0)
    }

    /// Gets the scheduling state of the thread, or `None` once it has been released.
    pub fn state(self) -> Option<ThreadState> {
        Scheduler::current().thread_state(self.0)
    }

    /// Gets the name the thread was created with. `None` if it has none or has been released.
    pub fn name(self) -> Option<String> {
        Scheduler::current().lookup(self.0).and_then(|thread| thread.name().map(str::to_owned))
    }

    /// Gets the recorded priority of the thread, or `None` once it has been released.
    pub fn priority(self) -> Option<i32> {
        Scheduler::current().lookup(self.0).map(|thread| thread.priority())
    }
}

/// Creates a thread running `f` with default attributes.
pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + 'static,
    T: 'static
{
    ThreadAttr::new().spawn(f)
}

/// Gets a handle to the calling thread.
///
/// # Panics
///
/// Panics if called outside of a runtime.
pub fn current() -> ThreadHandle {
    ThreadHandle(Scheduler::current().current_thread().id())
}

/// Lets every other runnable thread run before the current one continues.
pub fn yield_now() {
    Scheduler::current().yield_current();
}

/// Blocks the current thread for at least `dur`. A zero duration yields.
pub fn sleep(dur: Duration) {
    let sched = Scheduler::current();

    if dur.is_zero() {
        sched.yield_current();
        return;
    }

    let start = Instant::now();
    loop {
        let elapsed = start.elapsed();
        if elapsed >= dur {
            break;
        }

        // Deadlines too far in the future to represent are approached in steps.
        let step = (dur - elapsed).min(Duration::from_secs(u32::MAX as u64));
        sched.sleep_current(Instant::now() + step);
    }
}

/// Terminates the current thread, making `value` its exit value. Thread-specific data destructors still run.
///
/// Termination unwinds the thread's stack, so destructors of values on it run as well.
///
/// # Panics
///
/// Calling this on the thread that entered the runtime turns into a panic, since that thread has no exit value.
pub fn exit<T: 'static>(value: T) -> ! {
    drop(Scheduler::current());
    panic::resume_unwind(Box::new(ExitRequest(Box::new(value))))
}

/// Formats the state of every thread in the current runtime.
pub fn dump_info() -> String {
    Scheduler::current().dump_info()
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::test_util;

    #[test]
    fn test_stack_size() {
        test_util::run(|| {
            let mut attr = ThreadAttr::new();

            assert_eq!(crate::runtime::DEFAULT_STACK_SIZE, attr.stack_size());
            assert!(matches!(attr.set_stack_size(MIN_STACK_SIZE - 1), Err(Error::InvalidArgument)));
            assert_eq!(crate::runtime::DEFAULT_STACK_SIZE, attr.stack_size());

            attr.set_stack_size(MIN_STACK_SIZE).unwrap();
            assert_eq!(MIN_STACK_SIZE, attr.stack_size());
            assert_eq!(3, attr.spawn(|| 1 + 2).unwrap().join().unwrap());
        });
    }

    #[test]
    fn test_stack_address() {
        test_util::run(|| {
            let mut mem = vec![0u128; 64 * 1024 / 16];
            let base = NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap();
            let mut attr = ThreadAttr::new();

            attr.set_stack_size(mem.len() * 16).unwrap();
            assert!(matches!(
                unsafe { attr.set_stack_address(NonNull::new(base.as_ptr().wrapping_add(1)).unwrap()) },
                Err(Error::InvalidArgument)
            ));
            assert_eq!(None, attr.stack_address());

            unsafe { attr.set_stack_address(base).unwrap() };
            assert_eq!(Some(base), attr.stack_address());

            let child = attr
                .spawn(move || {
                    let local = 0u8;
                    &local as *const u8 as usize
                })
                .unwrap();
            let addr = child.join().unwrap();

            assert!(addr >= base.as_ptr() as usize && addr < base.as_ptr() as usize + mem.len() * 16);
            drop(mem);
        });
    }

    #[test]
    fn test_priority_and_name() {
        test_util::run(|| {
            let mut attr = ThreadAttr::new();

            assert!(matches!(attr.set_priority(MAX_PRIORITY + 1), Err(Error::InvalidArgument)));
            assert!(matches!(attr.set_priority(MIN_PRIORITY - 1), Err(Error::InvalidArgument)));
            assert_eq!(DEFAULT_PRIORITY, attr.priority());

            attr.set_priority(MAX_PRIORITY).unwrap();
            attr.set_name("worker");

            let child = attr.spawn(|| current().name()).unwrap();
            assert_eq!(Some(MAX_PRIORITY), child.thread().priority());
            assert_eq!(Some("worker".to_owned()), child.join().unwrap());
            assert_eq!(Some("main".to_owned()), current().name());
        });
    }

    #[test]
    fn test_detached_attr() {
        test_util::run(|| {
            let ran = Rc::new(Cell::new(false));
            let mut attr = ThreadAttr::new();
            attr.set_detached(true);

            let child = {
                let ran = ran.clone();
                attr.spawn(move || ran.set(true)).unwrap()
            };

            assert!(matches!(child.join(), Err(Error::NoSuchThread)));
            thread_yield_until(|| ran.get());
            assert_eq!(None, child.thread().state());
        });
    }

    #[test]
    fn test_exit_type_mismatch() {
        test_util::run(|| {
            let child = spawn(|| -> u32 { exit("not a number") }).unwrap();

            assert!(matches!(child.join(), Err(Error::InvalidArgument)));
        });
    }

    #[test]
    fn test_exit_runs_drops() {
        test_util::run(|| {
            struct SetOnDrop(Rc<Cell<bool>>);

            impl Drop for SetOnDrop {
                fn drop(&mut self) {
                    self.0.set(true);
                }
            }

            let dropped = Rc::new(Cell::new(false));
            let child = {
                let dropped = dropped.clone();
                spawn(move || {
                    let _guard = SetOnDrop(dropped);
                    exit(5i64)
                })
                .unwrap()
            };

            assert_eq!(5i64, child.join().unwrap());
            assert!(dropped.get());
        });
    }

    #[test]
    fn test_sleep() {
        test_util::run(|| {
            let start = Instant::now();

            sleep(Duration::from_millis(20));
            assert!(start.elapsed() >= Duration::from_millis(20));
            sleep(Duration::ZERO);
        });
    }

    fn thread_yield_until(mut f: impl FnMut() -> bool) {
        while !f() {
            yield_now();
        }
    }
}
