//! Entering and leaving a runtime.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use static_assertions::{assert_not_impl_any, const_assert};

use crate::error::{Error, Result};
use crate::sched::task::ExitRequest;
use crate::sched::Scheduler;
use crate::{logger, options, specific};

pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
pub const MIN_STACK_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_THREADS: usize = 1024;
pub const DEFAULT_TIMESLICE: Duration = Duration::from_millis(100);

/// How many times thread-specific data destructors are run at thread exit while they keep storing new values.
pub const DESTRUCTOR_ITERATIONS: usize = 4;

const_assert!(DEFAULT_STACK_SIZE >= MIN_STACK_SIZE);
const_assert!(DESTRUCTOR_ITERATIONS > 0);

/// Settings of a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// The stack size of threads created without an explicit one.
    pub stack_size: usize,
    /// The most threads, including the main thread, that may exist at once. Terminated threads that have not been joined count.
    pub max_threads: usize,
    /// How long a thread may run before I/O calls make it yield to other runnable threads.
    pub timeslice: Duration,
    pub destructor_iterations: usize
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stack_size < MIN_STACK_SIZE || self.max_threads == 0 || self.destructor_iterations == 0 {
            Err(Error::InvalidArgument)
        } else {
            Ok(())
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            stack_size: DEFAULT_STACK_SIZE,
            max_threads: DEFAULT_MAX_THREADS,
            timeslice: DEFAULT_TIMESLICE,
            destructor_iterations: DESTRUCTOR_ITERATIONS
        }
    }
}

/// A user-level threading runtime, run on the OS thread that calls [`Runtime::run`].
pub struct Runtime {
    sched: Rc<Scheduler>
}

assert_not_impl_any!(Runtime: Send, Sync);

impl Runtime {
    /// Creates a runtime configured by the `UTHREAD_OPTIONS` environment variable. If the options set a `log` level, the stderr logger is
    /// installed unless the program already installed a logger.
    pub fn new() -> Runtime {
        if options::get().try_get::<log::LevelFilter>("log").is_some() {
            let _ = logger::init();
        }

        Runtime {
            sched: Rc::new(Scheduler::new(options::config().clone()))
        }
    }

    /// Creates a runtime with an explicit configuration. Fails with [`Error::InvalidArgument`] if the configuration does not validate.
    pub fn with_config(config: RuntimeConfig) -> Result<Runtime> {
        config.validate()?;

        Ok(Runtime {
            sched: Rc::new(Scheduler::new(config))
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.sched.config()
    }

    /// Runs `f` as the main thread of the runtime and returns its result once every other thread has terminated.
    ///
    /// # Panics
    ///
    /// Panics if another runtime is already running on this OS thread. If `f` panics, the threads still alive are dropped without running
    /// further and the panic is resumed. If a thread panicked and nobody joined it, that panic is resumed once all threads are done.
    pub fn run<F, T>(self, f: F) -> T
    where
        F: FnOnce() -> T
    {
        let sched = self.sched;

        sched.enter();
        log::debug!("Entered runtime");

        let value = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => value,
            Err(payload) => {
                sched.abandon();
                Scheduler::leave();

                if payload.is::<ExitRequest>() {
                    panic!("uthread::exit called on the main thread");
                }

                panic::resume_unwind(payload);
            }
        };

        sched.drain();

        let main = sched.current_thread();
        let destructors = panic::catch_unwind(AssertUnwindSafe(|| specific::run_destructors(&sched, &main)));
        drop(main);

        let lost_panic = sched.shutdown();
        Scheduler::leave();
        log::debug!("Left runtime");

        if let Err(payload) = destructors {
            panic::resume_unwind(payload);
        }

        if let Some(payload) = lost_panic {
            panic::resume_unwind(payload);
        }

        value
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

/// Runs `f` as the main thread of a new runtime configured from the environment. Shorthand for `Runtime::new().run(f)`.
pub fn run<F, T>(f: F) -> T
where
    F: FnOnce() -> T
{
    Runtime::new().run(f)
}

#[cfg(test)]
mod test {
    use std::panic;

    use super::*;
    use crate::{test_util, thread};

    #[test]
    fn test_validate() {
        assert!(RuntimeConfig::default().validate().is_ok());

        let small = RuntimeConfig {
            stack_size: MIN_STACK_SIZE - 1,
            ..RuntimeConfig::default()
        };
        assert!(matches!(Runtime::with_config(small), Err(Error::InvalidArgument)));

        let no_threads = RuntimeConfig {
            max_threads: 0,
            ..RuntimeConfig::default()
        };
        assert!(no_threads.validate().is_err());
    }

    #[test]
    fn test_run_value() {
        assert_eq!(42, test_util::run(|| thread::spawn(|| 40).unwrap().join().unwrap() + 2));
    }

    #[test]
    fn test_sequential_runtimes() {
        for i in 0..3 {
            assert_eq!(i, test_util::run(move || i));
        }
    }

    #[test]
    fn test_nested_run() {
        test_util::run(|| {
            assert!(panic::catch_unwind(|| run(|| ())).is_err());
        });
    }

    #[test]
    fn test_main_panic() {
        let result = panic::catch_unwind(|| {
            test_util::run(|| {
                thread::spawn(|| loop {
                    thread::yield_now();
                })
                .unwrap();
                thread::yield_now();
                panic!("main failed");
            })
        });

        assert_eq!(Some(&"main failed"), result.unwrap_err().downcast_ref::<&str>());
        assert!(test_util::run(|| true));
    }

    #[test]
    fn test_main_exit() {
        let result = panic::catch_unwind(|| test_util::run(|| thread::exit(())));

        assert!(result.is_err());
    }
}
