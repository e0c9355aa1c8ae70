//! The user thread scheduler.
//!
//! Every runtime has exactly one [`Scheduler`], which owns the run queue, the registry of thread control blocks, the file table and the
//! thread-specific data keys. It is reachable from the code running in the runtime through a thread-local entry point, so each OS thread
//! can host at most one runtime at a time.
//!
//! Scheduling is strictly cooperative: a context switch only ever happens when the running thread blocks, yields, or exits. Whenever the
//! run queue is empty, the scheduler waits in a single `poll` call for any file descriptor a thread is blocked on to become ready, or for
//! the nearest sleep or timeout deadline to pass.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::arch::{ContextSwitch, SavedContext, Stack};
use crate::error::{Error, Result};
use crate::io::{poll_timeout_ms, FileTable};
use crate::runtime::RuntimeConfig;
use crate::specific::{self, KeyRegistry};
use crate::sync::critical::CriticalLock;
use crate::sync::Mutex;
use crate::thread::{ThreadAttr, DEFAULT_PRIORITY};
use crate::util::fatal;

mod queue;
pub mod task;
pub mod wait;

use queue::RunQueue;
use task::{Location, StartFn, Thread, ThreadFlags, ThreadId, ThreadOutcome, ThreadState};

thread_local! {
    static CURRENT: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

struct SchedCore {
    threads: BTreeMap<ThreadId, Rc<Thread>>,
    run_queue: RunQueue,
    current: Option<Rc<Thread>>,
    reap: Vec<Rc<Thread>>,
    next_id: u64,
    live: usize,
    drain: Option<Rc<Thread>>,
    lost_panic: Option<Box<dyn Any + Send>>
}

impl SchedCore {
    /// Puts a thread at the end of the run queue. The thread must not be on any other queue.
    fn enqueue(&mut self, thread: &Rc<Thread>) {
        {
            let mut internal = thread.lock();

            if internal.location != Location::None {
                fatal!("{} enqueued while already at {:?}", thread.debug_name(), internal.location);
            }

            internal.state = ThreadState::Runnable;
            internal.location = Location::RunQueue;
        }

        thread.set_deadline(None);
        self.run_queue.push(thread.clone());
    }

    #[cfg(feature = "queue_checks")]
    fn check_queues(&self) {
        self.run_queue.check();

        let queued = self.threads.values().filter(|thread| thread.lock().location == Location::RunQueue).count();
        if queued != self.run_queue.len() {
            fatal!("{} thread(s) are marked runnable but the run queue holds {}", queued, self.run_queue.len());
        }
    }
}

pub(crate) struct Scheduler {
    config: RuntimeConfig,
    core: CriticalLock<SchedCore>,
    pub(crate) files: FileTable,
    pub(crate) keys: KeyRegistry,
    pub(crate) once_lock: Mutex<()>
}

impl Scheduler {
    pub(crate) fn new(config: RuntimeConfig) -> Scheduler {
        Scheduler {
            config,
            core: CriticalLock::new(SchedCore {
                threads: BTreeMap::new(),
                run_queue: RunQueue::default(),
                current: None,
                reap: Vec::new(),
                next_id: 0,
                live: 0,
                drain: None,
                lost_panic: None
            }),
            files: FileTable::new(),
            keys: KeyRegistry::new(),
            once_lock: Mutex::new(())
        }
    }

    /// Gets the scheduler of the runtime running on this OS thread, if any.
    pub(crate) fn try_current() -> Option<Rc<Scheduler>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Gets the scheduler of the runtime running on this OS thread.
    ///
    /// # Panics
    ///
    /// Panics if no runtime is running on this OS thread.
    #[track_caller]
    pub(crate) fn current() -> Rc<Scheduler> {
        match Scheduler::try_current() {
            Some(sched) => sched,
            None => panic!("not running inside a uthread runtime")
        }
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Installs this scheduler as the current one and turns the calling code into the runtime's main thread.
    ///
    /// # Panics
    ///
    /// Panics if a runtime is already running on this OS thread.
    pub(crate) fn enter(self: &Rc<Self>) {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();

            if current.is_some() {
                panic!("a uthread runtime is already running on this OS thread");
            }

            *current = Some(self.clone());
        });

        let mut core = self.core.lock();

        core.next_id += 1;
        let id = ThreadId(core.next_id);
        let main = Rc::new(Thread::new(
            id,
            Some("main".to_owned()),
            DEFAULT_PRIORITY,
            ThreadFlags::MAIN | ThreadFlags::DETACHED,
            SavedContext::current(),
            None,
            None
        ));

        main.lock().state = ThreadState::Running;
        main.start_slice();
        core.threads.insert(id, main.clone());
        core.live += 1;
        core.current = Some(main);
    }

    /// Removes the current scheduler from this OS thread.
    pub(crate) fn leave() {
        CURRENT.with(|current| current.borrow_mut().take());
    }

    pub(crate) fn current_thread(&self) -> Rc<Thread> {
        match self.core.lock().current {
            Some(ref thread) => thread.clone(),
            None => fatal!("scheduler has no current thread")
        }
    }

    pub(crate) fn lookup(&self, id: ThreadId) -> Option<Rc<Thread>> {
        self.core.lock().threads.get(&id).cloned()
    }

    /// Creates a new thread running `start`. The thread is put on the run queue (or left suspended) but does not run until the current
    /// thread yields or blocks.
    pub(crate) fn spawn(&self, attr: &ThreadAttr, start: StartFn) -> Result<ThreadId> {
        if self.core.lock().threads.len() >= self.config.max_threads {
            log::warn!("Cannot create thread: limit of {} threads reached", self.config.max_threads);
            return Err(Error::ResourceExhausted);
        }

        let stack = match attr.stack_address() {
            // SAFETY: Setting a stack address on a ThreadAttr requires the memory to stay valid for its stack size.
            Some(addr) => unsafe { Stack::from_raw(addr, attr.stack_size()) },
            None => Stack::allocate(attr.stack_size()).map_err(|err| {
                log::warn!("Failed to allocate a {} byte thread stack: {}", attr.stack_size(), err);
                Error::ResourceExhausted
            })?
        };
        let context = SavedContext::prepare(&stack, thread_entry)?;

        let mut flags = ThreadFlags::empty();
        if attr.detached() {
            flags |= ThreadFlags::DETACHED;
        }

        let mut core = self.core.lock();

        core.next_id += 1;
        let id = ThreadId(core.next_id);
        let thread = Rc::new(Thread::new(
            id,
            attr.name().map(str::to_owned),
            attr.priority(),
            flags,
            context,
            Some(stack),
            Some(start)
        ));

        core.threads.insert(id, thread.clone());
        core.live += 1;

        if !attr.create_suspended() {
            core.enqueue(&thread);
        }

        log::debug!("Created {} with a {} byte stack", thread.debug_name(), attr.stack_size());
        Ok(id)
    }

    /// Marks the current thread as blocked at `location`. The caller must put the returned thread on the queue named by `location` and
    /// then call [`Scheduler::schedule`] without running any other code that could block in between.
    pub(crate) fn block_current(&self, state: ThreadState, location: Location, deadline: Option<Instant>) -> Rc<Thread> {
        let thread = self.current_thread();

        {
            let mut internal = thread.lock();

            if internal.state != ThreadState::Running || internal.location != Location::None {
                fatal!("{} blocked from state {:?} at {:?}", thread.debug_name(), internal.state, internal.location);
            }

            internal.state = state;
            internal.location = location;
        }

        thread.set_deadline(deadline);
        thread.take_timed_out();
        thread
    }

    /// Moves a blocked thread to the run queue if it is still waiting at a location accepted by `expected`. Returns `false` for stale
    /// queue entries, e.g. threads that were already woken by a timeout.
    pub(crate) fn wake(&self, thread: &Rc<Thread>, expected: impl FnOnce(Location) -> bool) -> bool {
        {
            let mut internal = thread.lock();

            if !expected(internal.location) {
                return false;
            }

            internal.location = Location::None;
        }

        self.core.lock().enqueue(thread);
        true
    }

    /// Moves the current thread to the end of the run queue and runs the next runnable thread.
    pub(crate) fn yield_current(&self) {
        let thread = self.current_thread();

        self.core.lock().enqueue(&thread);
        drop(thread);
        self.schedule();
    }

    /// Yields if the current thread has used up its time slice and another thread is waiting to run.
    pub(crate) fn maybe_yield(&self) {
        if self.current_thread().slice_start().elapsed() >= self.config.timeslice && !self.core.lock().run_queue.is_empty() {
            log::trace!("Time slice expired");
            self.yield_current();
        }
    }

    pub(crate) fn sleep_current(&self, deadline: Instant) {
        drop(self.block_current(ThreadState::Sleeping, Location::Sleep, Some(deadline)));
        self.schedule();
    }

    /// Blocks the main thread until it is the only thread left that has not terminated.
    pub(crate) fn drain(&self) {
        while self.core.lock().live > 1 {
            let main = self.block_current(ThreadState::BlockedOnJoin, Location::Drain, None);

            self.core.lock().drain = Some(main);
            self.schedule();
        }
    }

    /// Switches to the next runnable thread. The current thread must already be on a queue (or terminated); this returns when it is
    /// scheduled again.
    pub(crate) fn schedule(&self) {
        let next = self.pick_next();
        self.switch_to(next);
    }

    fn pick_next(&self) -> Rc<Thread> {
        loop {
            self.expire_timers();

            if self.files.has_waiters() {
                self.poll_io(Some(Duration::ZERO));
            }

            {
                let mut core = self.core.lock();

                #[cfg(feature = "queue_checks")]
                core.check_queues();

                if let Some(next) = core.run_queue.pop() {
                    return next;
                }
            }

            let timeout = self.next_deadline().map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if timeout.is_none() && !self.files.has_waiters() {
                fatal!("Deadlock: no thread can ever become runnable\n{}", self.dump_info());
            }

            self.poll_io(timeout);
        }
    }

    fn switch_to(&self, next: Rc<Thread>) {
        {
            let mut internal = next.lock();

            if internal.location != Location::RunQueue {
                fatal!("{} dequeued from the run queue while at {:?}", next.debug_name(), internal.location);
            }

            internal.state = ThreadState::Running;
            internal.location = Location::None;
        }

        next.start_slice();

        let (from, to) = {
            let mut core = self.core.lock();
            let prev = match core.current.replace(next.clone()) {
                Some(prev) => prev,
                None => fatal!("scheduler has no current thread")
            };

            if Rc::ptr_eq(&prev, &next) {
                return;
            }

            log::trace!("Switching from {} to {}", prev.debug_name(), next.debug_name());
            (prev.context_ptr(), next.context_ptr())
        };

        drop(next);

        // SAFETY: Both contexts belong to threads that are kept alive by the registry or the reap list until after the switch, and no lock
        //         is held across it.
        unsafe { SavedContext::switch(from, to) };

        self.reap();
    }

    /// Frees the stacks of threads that have terminated since the last call. Never called on a terminated thread's own stack.
    fn reap(&self) {
        let dead = mem::take(&mut self.core.lock().reap);

        for thread in dead {
            thread.release_stack();
        }
    }

    fn expire_timers(&self) {
        let now = Instant::now();
        let expired: Vec<_> = self
            .core
            .lock()
            .threads
            .values()
            .filter(|thread| thread.deadline().map_or(false, |deadline| deadline <= now))
            .cloned()
            .collect();

        for thread in expired {
            if self.wake(&thread, Location::is_waiting) {
                thread.set_timed_out();
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.core.with_lock(|core| core.threads.values().filter_map(|thread| thread.deadline()).min())
    }

    /// Waits up to `timeout` (forever if `None`) for a file descriptor some thread is waiting on to become ready, and wakes its waiters.
    fn poll_io(&self, timeout: Option<Duration>) {
        let mut fds = self.files.poll_set();
        let timeout_ms = poll_timeout_ms(timeout);

        // SAFETY: fds is a valid slice of pollfd structures for the duration of the call.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        if ready < 0 {
            let err = io::Error::last_os_error();

            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => return,
                _ => fatal!("poll failed: {}", err)
            }
        }

        if ready > 0 {
            for thread in self.files.dispatch(&fds) {
                self.wake(&thread, |loc| matches!(loc, Location::IoWait(..) | Location::PollWait | Location::SignalWait));
            }
        }
    }

    /// Formats a line for every thread with its scheduling state.
    pub(crate) fn dump_info(&self) -> String {
        let core = self.core.lock();

        core.threads
            .values()
            .map(|thread| {
                let internal = thread.lock();
                let current = core.current.as_ref().map_or(false, |current| Rc::ptr_eq(current, thread));

                format!(
                    "{} state={:?} location={:?}{}",
                    thread.debug_name(),
                    internal.state,
                    internal.location,
                    if current { " (current)" } else { "" }
                )
            })
            .join("\n")
    }

    /// Tears down the runtime after the main thread finished. Returns the payload of a panic no thread ever collected, if any.
    pub(crate) fn shutdown(&self) -> Option<Box<dyn Any + Send>> {
        self.reap();
        self.files.restore_flags();

        let (threads, mut lost_panic) = {
            let mut core = self.core.lock();

            core.current = None;
            (mem::take(&mut core.threads), core.lost_panic.take())
        };

        for thread in threads.into_values() {
            let outcome = thread.lock().outcome.take();

            if let Some(Err(payload)) = outcome {
                log::error!("{} panicked and was never joined", thread.debug_name());
                lost_panic.get_or_insert(payload);
            }
        }

        lost_panic
    }

    /// Tears down the runtime after the main thread panicked. Threads that have not terminated are dropped without being resumed.
    pub(crate) fn abandon(&self) {
        let live = self.core.lock().live;
        if live > 1 {
            log::warn!("Main thread panicked; abandoning {} thread(s)\n{}", live - 1, self.dump_info());
        }

        let leftovers = {
            let mut core = self.core.lock();

            core.current = None;
            core.drain = None;
            (mem::take(&mut core.run_queue), mem::take(&mut core.threads), mem::take(&mut core.reap))
        };

        self.files.restore_flags();
        drop(leftovers);
    }
}

/// Waits for a contended spinlock: yields to other user threads inside a runtime, spins otherwise.
pub(crate) fn relax() {
    match Scheduler::try_current() {
        Some(sched) => sched.yield_current(),
        None => std::hint::spin_loop()
    }
}

/// The entry point of every thread created by [`Scheduler::spawn`].
extern "C" fn thread_entry() {
    let start = {
        let sched = Scheduler::current();

        sched.reap();
        sched.current_thread().take_start()
    };

    let outcome = match start {
        Some(start) => task::catch_exit(start),
        None => fatal!("thread started without a start routine")
    };

    exit_current(outcome)
}

/// Terminates the current thread: runs its thread-specific data destructors, records its outcome and switches away for good.
pub(crate) fn exit_current(outcome: ThreadOutcome) -> ! {
    let sched: *const Scheduler = {
        let sched = Scheduler::current();
        let thread = sched.current_thread();

        let destructors = panic::catch_unwind(AssertUnwindSafe(|| specific::run_destructors(&sched, &thread)));
        let outcome = match (outcome, destructors) {
            (Ok(_), Err(payload)) => Err(payload),
            (outcome, _) => outcome
        };

        drop(thread);
        sched.finish_current(outcome);
        Rc::as_ptr(&sched)
    };

    // SAFETY: The runtime's thread-local slot holds a strong reference to the scheduler for as long as any of its threads can run. No
    //         reference counted pointer may be left on this stack, since it is never unwound.
    let sched = unsafe { &*sched };
    let next = sched.pick_next();

    sched.switch_to(next);
    fatal!("terminated thread was resumed")
}
