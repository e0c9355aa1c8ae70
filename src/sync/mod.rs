//! Synchronization primitives for user threads.
//!
//! Every primitive here is built on [`RawSpinlock`], an atomic test-and-set lock. Blocking primitives put the calling thread on a FIFO
//! wait list and switch to another thread instead of spinning, since the thread holding the resource can only make progress once the
//! current thread gives up the kernel thread they share.

pub(crate) mod critical;
pub mod condvar;
pub mod mutex;
pub mod once;
pub mod spinlock;

pub use condvar::{Condvar, WaitTimeoutResult};
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use once::Once;
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};
