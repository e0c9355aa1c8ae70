//! Saving and restoring the execution context of user threads.
//!
//! The scheduler only depends on the [`ContextSwitch`] trait. The backend is chosen per target.

use std::io;

mod stack;

pub use stack::Stack;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_env = "gnu"))] {
        mod ucontext;

        pub(crate) use self::ucontext::UContext as SavedContext;
    } else {
        compile_error!("uthread has no context switch backend for this target");
    }
}

/// A saved execution context that the scheduler can switch into.
pub(crate) trait ContextSwitch: Sized {
    /// Creates an empty context for the code that is already running. It is filled in the first time it is switched away from.
    fn current() -> Self;

    /// Creates a context that begins running `entry` on `stack` the first time it is switched to. `entry` must never return.
    fn prepare(stack: &Stack, entry: extern "C" fn()) -> io::Result<Self>;

    /// Saves the running context into `from` and resumes `to`. Returns when another context switches back into `from`.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for the duration of the switch, `to` must have been prepared or previously saved, and `from` must stay
    /// alive until it is resumed or discarded.
    unsafe fn switch(from: *mut Self, to: *const Self);
}

static_assertions::assert_impl_all!(SavedContext: ContextSwitch);
