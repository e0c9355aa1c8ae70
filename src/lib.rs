//! User-level threads for Linux.
//!
//! `uthread` runs any number of cooperatively scheduled threads on a single OS thread. Threads are switched only when the running thread
//! blocks on a lock, a join, a condition, a sleep, a file descriptor or a signal, or yields explicitly. Blocking I/O goes through [`io`],
//! which suspends just the calling thread until its descriptor is ready.
//!
//! ```no_run
//! let value = uthread::run(|| {
//!     let child = uthread::thread::spawn(|| 6 * 7).unwrap();
//!     child.join().unwrap()
//! });
//! assert_eq!(42, value);
//! ```

mod arch;
pub mod error;
pub mod io;
pub mod logger;
pub mod options;
pub mod runtime;
mod sched;
pub mod signal;
pub mod specific;
pub mod sync;
pub mod thread;

mod util;

#[cfg(test)]
mod test_util;

pub use error::{Error, Result};
pub use runtime::{run, Runtime, RuntimeConfig, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use thread::{JoinHandle, ThreadAttr, ThreadHandle, ThreadId, ThreadState};
