use std::{io, mem, ptr};

use libc::{c_int, ucontext_t};

use super::{ContextSwitch, Stack};
use crate::util::fatal;

extern "C" {
    fn getcontext(ucp: *mut ucontext_t) -> c_int;
    fn makecontext(ucp: *mut ucontext_t, func: extern "C" fn(), argc: c_int, ...);
    fn swapcontext(oucp: *mut ucontext_t, ucp: *const ucontext_t) -> c_int;
}

/// A context saved with the C library's `ucontext` functions.
///
/// glibc stores pointers into the `ucontext_t` itself (e.g. to the floating point state), so it is kept in a box and never moved once
/// initialized.
pub struct UContext(Box<ucontext_t>);

impl UContext {
    fn zeroed() -> UContext {
        // SAFETY: ucontext_t is a plain C struct for which all-zeroes is a valid value.
        UContext(Box::new(unsafe { mem::zeroed() }))
    }
}

impl ContextSwitch for UContext {
    fn current() -> UContext {
        UContext::zeroed()
    }

    fn prepare(stack: &Stack, entry: extern "C" fn()) -> io::Result<UContext> {
        let mut ctx = UContext::zeroed();

        // SAFETY: The context is heap allocated and outlives every use of the pointers glibc stores into it.
        if unsafe { getcontext(&mut *ctx.0) } != 0 {
            return Err(io::Error::last_os_error());
        }

        ctx.0.uc_stack.ss_sp = stack.base().cast();
        ctx.0.uc_stack.ss_size = stack.size();
        ctx.0.uc_stack.ss_flags = 0;
        ctx.0.uc_link = ptr::null_mut();

        // SAFETY: The stack was set above and the entry point takes no arguments.
        unsafe { makecontext(&mut *ctx.0, entry, 0) };

        Ok(ctx)
    }

    unsafe fn switch(from: *mut UContext, to: *const UContext) {
        let from: *mut ucontext_t = &mut *(*from).0;
        let to: *const ucontext_t = &*(*to).0;

        if swapcontext(from, to) != 0 {
            fatal!("swapcontext failed: {}", io::Error::last_os_error());
        }
    }
}
