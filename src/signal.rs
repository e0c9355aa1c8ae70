//! Waiting for signals.
//!
//! A thread calling [`wait`] is suspended until one of the signals it names is pending, while the other threads keep running. The signals
//! must be blocked in the OS thread that runs the runtime, as with `sigwait`, so that they stay pending instead of being delivered to a
//! handler. [`block`] does that for the whole runtime.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::sched::Scheduler;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn sigset(signals: &[libc::c_int]) -> io::Result<libc::sigset_t> {
    // SAFETY: sigset_t is plain old data and sigemptyset initializes it.
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };

    // SAFETY: set is a valid sigset_t.
    cvt(unsafe { libc::sigemptyset(&mut set) })?;

    for &signal in signals {
        // SAFETY: set is a valid sigset_t. Invalid signal numbers are rejected with EINVAL.
        cvt(unsafe { libc::sigaddset(&mut set, signal) })?;
    }

    Ok(set)
}

fn sigmask(how: libc::c_int, set: &libc::sigset_t) -> io::Result<libc::sigset_t> {
    // SAFETY: sigset_t is plain old data.
    let mut old: libc::sigset_t = unsafe { mem::zeroed() };

    // SAFETY: Both pointers refer to valid sigset_t values. pthread_sigmask returns an error number instead of setting errno.
    match unsafe { libc::pthread_sigmask(how, set, &mut old) } {
        0 => Ok(old),
        err => Err(io::Error::from_raw_os_error(err))
    }
}

/// Blocks `signals` in the calling OS thread, so that they stay pending until a thread collects them with [`wait`]. Since all threads of
/// a runtime share one OS thread, this applies to every one of them.
pub fn block(signals: &[libc::c_int]) -> io::Result<()> {
    sigmask(libc::SIG_BLOCK, &sigset(signals)?).map(drop)
}

/// Unblocks `signals` in the calling OS thread. Signals still pending are delivered right away.
pub fn unblock(signals: &[libc::c_int]) -> io::Result<()> {
    sigmask(libc::SIG_UNBLOCK, &sigset(signals)?).map(drop)
}

/// Suspends the current thread until one of `signals` is pending, then accepts it and returns its number.
///
/// Several threads may wait for the same signal; each pending signal is accepted by exactly one of them. Outside of a runtime this is a
/// plain `sigwait`.
///
/// Fails with [`io::ErrorKind::InvalidInput`] if `signals` names an invalid signal.
pub fn wait(signals: &[libc::c_int]) -> io::Result<libc::c_int> {
    let set = sigset(signals)?;

    let Some(sched) = Scheduler::try_current() else {
        let mut signal = 0;

        // SAFETY: Both pointers are valid. sigwait returns an error number instead of setting errno.
        return match unsafe { libc::sigwait(&set, &mut signal) } {
            0 => Ok(signal),
            err => Err(io::Error::from_raw_os_error(err))
        };
    };

    // SAFETY: set is a valid sigset_t and the returned descriptor is owned by nothing else.
    let fd = unsafe { OwnedFd::from_raw_fd(cvt(libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC))?) };

    loop {
        // SAFETY: signalfd_siginfo is plain old data.
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };

        // SAFETY: info is valid for writes of its size.
        let ret = unsafe { libc::read(fd.as_raw_fd(), (&mut info as *mut libc::signalfd_siginfo).cast(), mem::size_of_val(&info)) };

        if ret >= 0 {
            log::trace!("Accepted signal {}", info.ssi_signo);
            return Ok(info.ssi_signo as libc::c_int);
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => {},
            io::ErrorKind::WouldBlock => sched.files.wait_signal(&sched, fd.as_raw_fd()),
            _ => return Err(err)
        }
    }
}
