//! I/O on raw file descriptors that blocks only the calling user thread.
//!
//! The functions here wrap the system calls of the same names. When one would block, the calling thread is suspended until the descriptor
//! is ready and other threads run in the meantime. Called outside of a runtime they behave exactly like the plain system calls.
//!
//! Each descriptor has a read lock and a write lock. [`read`] and [`write`] hold the matching lock for the whole operation, so concurrent
//! writes to the same descriptor are never interleaved. [`lock_fd`] takes the locks explicitly to make a sequence of operations atomic.

use std::io;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::sched::Scheduler;

mod fd_table;
mod reactor;

pub use fd_table::FdKind;
pub(crate) use fd_table::FileTable;

bitflags! {
    /// The directions of a file descriptor an operation is interested in. Each direction has its own lock, see [`lock_fd`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Converts a poll timeout to milliseconds, rounding up so that a short timeout still waits. `None` waits forever.
pub(crate) fn poll_timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(timeout) => timeout.as_nanos().div_ceil(1_000_000).min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: The buffer is valid for writes of its length.
    cvt(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: The buffer is valid for reads of its length.
    cvt(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
}

/// Holds the current thread's locks on some directions of a file descriptor. Dropping it releases them.
#[must_use]
pub struct FdLockGuard {
    fd: RawFd,
    interest: Interest,
    _not_send: PhantomData<Rc<()>>
}

impl FdLockGuard {
    /// The locked descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The directions this guard holds a lock level on.
    pub fn interest(&self) -> Interest {
        self.interest
    }
}

impl Drop for FdLockGuard {
    fn drop(&mut self) {
        if let Some(sched) = Scheduler::try_current() {
            sched.files.unlock(&sched, self.fd, self.interest);
        }
    }
}

/// Locks the directions of `fd` named by `interest` for the current thread, waiting at most `timeout` for other threads to release them.
/// A thread may lock a descriptor it already holds; each guard releases one level.
///
/// Fails with [`io::ErrorKind::TimedOut`] if the timeout passes first.
///
/// # Panics
///
/// Panics if called outside of a runtime.
pub fn lock_fd(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<FdLockGuard> {
    let sched = Scheduler::current();
    let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

    sched.files.lock(&sched, fd, interest, deadline)?;
    Ok(FdLockGuard {
        fd,
        interest,
        _not_send: PhantomData
    })
}

/// Reads from `fd` into `buf`, suspending the current thread until data is available.
///
/// If the program put `fd` into non-blocking mode itself, this fails with [`io::ErrorKind::WouldBlock`] instead of waiting.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let Some(sched) = Scheduler::try_current() else {
        return raw_read(fd, buf);
    };

    sched.maybe_yield();

    let _guard = lock_fd(fd, Interest::READ, None)?;

    loop {
        match raw_read(fd, buf) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
            Err(err) if err.kind() == io::ErrorKind::WouldBlock && sched.files.blocks(fd) => {
                sched.files.wait_ready(&sched, fd, Interest::READ);
            },
            result => return result
        }
    }
}

/// Writes all of `buf` to `fd`, suspending the current thread whenever the descriptor cannot take more data.
///
/// If the program put `fd` into non-blocking mode itself, this returns as soon as a write would block, with the number of bytes written
/// so far (failing with [`io::ErrorKind::WouldBlock`] if that is zero).
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let Some(sched) = Scheduler::try_current() else {
        return raw_write(fd, buf);
    };

    sched.maybe_yield();

    let _guard = lock_fd(fd, Interest::WRITE, None)?;
    let mut written = 0;

    while written < buf.len() {
        match raw_write(fd, &buf[written..]) {
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if !sched.files.blocks(fd) {
                    return if written > 0 { Ok(written) } else { Err(err) };
                }

                sched.files.wait_ready(&sched, fd, Interest::WRITE);
            },
            Err(err) => return if written > 0 { Ok(written) } else { Err(err) }
        }
    }

    Ok(written)
}

/// Closes `fd`. Waits for other threads to finish their reads and writes first; threads still waiting on the descriptor afterwards fail
/// with `EBADF`.
pub fn close(fd: RawFd) -> io::Result<()> {
    let Some(sched) = Scheduler::try_current() else {
        // SAFETY: close has no memory safety requirements.
        return cvt(unsafe { libc::close(fd) } as isize).map(drop);
    };

    if sched.files.user_flags(fd).is_some() {
        // The locks disappear with the table entry, so the guard is never released.
        std::mem::forget(lock_fd(fd, Interest::READ | Interest::WRITE, None)?);
    }

    sched.files.close(&sched, fd)
}

fn raw_fcntl(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> io::Result<libc::c_int> {
    // SAFETY: Only integer arguments are passed, so commands taking pointers fail instead of dereferencing anything.
    cvt(unsafe { libc::fcntl(fd, cmd, arg) } as isize).map(|ret| ret as libc::c_int)
}

/// Performs `fcntl(fd, cmd, arg)`.
///
/// `F_GETFL` and `F_SETFL` work on the flags the program sees, which differ from the kernel's for descriptors the runtime keeps in
/// non-blocking mode. Descriptors made by `F_DUPFD` and `F_DUPFD_CLOEXEC` share those flags with `fd`. Other commands are passed through
/// unchanged.
pub fn fcntl(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> io::Result<libc::c_int> {
    let Some(sched) = Scheduler::try_current() else {
        return raw_fcntl(fd, cmd, arg);
    };

    match cmd {
        libc::F_GETFL => {
            sched.files.register(fd)?;
            match sched.files.user_flags(fd) {
                Some(flags) => Ok(flags),
                None => raw_fcntl(fd, cmd, arg)
            }
        },
        libc::F_SETFL => sched.files.set_user_flags(fd, arg).map(|()| 0),
        libc::F_DUPFD | libc::F_DUPFD_CLOEXEC => {
            sched.files.register(fd)?;

            let new = raw_fcntl(fd, cmd, arg)?;
            sched.files.register_dup(fd, new)?;
            Ok(new)
        },
        _ => raw_fcntl(fd, cmd, arg)
    }
}

/// Duplicates `fd`, like `dup`. Inside a runtime the new descriptor shares `fd`'s status flags as the program sees them.
pub fn dup(fd: RawFd) -> io::Result<RawFd> {
    fcntl(fd, libc::F_DUPFD, 0)
}

/// Creates a pipe, returning its read end and write end. Inside a runtime both ends are tracked immediately.
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0; 2];

    // SAFETY: fds has room for the two descriptors pipe writes.
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) } as isize)?;

    if let Some(sched) = Scheduler::try_current() {
        sched.files.register(fds[0])?;
        sched.files.register(fds[1])?;
    }

    Ok((fds[0], fds[1]))
}

/// Waits until one of `fds` is ready or `timeout` passes (forever if `None`), suspending only the current thread. Fills in `revents` and
/// returns the number of ready descriptors, which is zero after a timeout.
///
/// An empty `fds` with a timeout just sleeps. An empty `fds` without one can never be woken; inside a runtime with no other thread that
/// could run, this is reported as a deadlock like any other wait that cannot end.
pub fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let raw_poll = |fds: &mut [libc::pollfd], timeout_ms: libc::c_int| {
        // SAFETY: fds is a valid slice of pollfd structures.
        cvt(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) } as isize)
    };

    let Some(sched) = Scheduler::try_current() else {
        return raw_poll(fds, poll_timeout_ms(timeout));
    };

    let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

    loop {
        match raw_poll(fds, 0) {
            Ok(0) => {},
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => return result
        }

        if timeout == Some(Duration::ZERO) || sched.files.wait_poll(&sched, fds, deadline) {
            return Ok(0);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::test_util;
    use crate::thread;

    #[test]
    fn test_read_blocks_thread_only() {
        test_util::run(|| {
            let (rd, wr) = pipe().unwrap();
            let progress = Rc::new(RefCell::new(Vec::new()));

            let reader = {
                let progress = progress.clone();
                thread::spawn(move || {
                    let mut buf = [0; 16];
                    let n = read(rd, &mut buf).unwrap();

                    progress.borrow_mut().push("read");
                    buf[..n].to_vec()
                })
                .unwrap()
            };

            thread::yield_now();
            assert_eq!(Some(thread::ThreadState::BlockedOnIo), reader.thread().state());
            progress.borrow_mut().push("main");

            assert_eq!(5, write(wr, b"hello").unwrap());
            assert_eq!(b"hello".to_vec(), reader.join().unwrap());
            assert_eq!(vec!["main", "read"], *progress.borrow());

            close(rd).unwrap();
            close(wr).unwrap();
        });
    }

    #[test]
    fn test_others_run_while_reader_blocks() {
        test_util::run(|| {
            let (rd, wr) = pipe().unwrap();
            let ticks = Rc::new(Cell::new(0));

            let reader = {
                let ticks = ticks.clone();
                thread::spawn(move || {
                    let mut buf = [0; 16];
                    let n = read(rd, &mut buf).unwrap();

                    (ticks.get(), buf[..n].to_vec())
                })
                .unwrap()
            };

            let writer = {
                let ticks = ticks.clone();
                thread::spawn(move || {
                    while ticks.get() < 3 {
                        thread::yield_now();
                    }

                    write(wr, b"data").unwrap()
                })
                .unwrap()
            };

            for _ in 0..3 {
                thread::yield_now();
                assert_eq!(Some(thread::ThreadState::BlockedOnIo), reader.thread().state());
                ticks.set(ticks.get() + 1);
            }

            assert_eq!((3, b"data".to_vec()), reader.join().unwrap());
            assert_eq!(4, writer.join().unwrap());

            close(rd).unwrap();
            close(wr).unwrap();
        });
    }

    #[test]
    fn test_dup() {
        let copy = test_util::run(|| {
            let (rd, wr) = pipe().unwrap();
            let dupfd = fcntl(rd, libc::F_DUPFD, 0).unwrap();

            assert_eq!(0, fcntl(dupfd, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK);

            let reader = thread::spawn(move || {
                let mut buf = [0; 4];
                read(dupfd, &mut buf).map(|n| buf[..n].to_vec()).map_err(|err| err.kind())
            })
            .unwrap();

            thread::yield_now();
            assert_eq!(Some(thread::ThreadState::BlockedOnIo), reader.thread().state());
            write(wr, b"ping").unwrap();
            assert_eq!(Ok(b"ping".to_vec()), reader.join().unwrap());

            let copy = dup(dupfd).unwrap();
            close(rd).unwrap();
            close(dupfd).unwrap();

            // SAFETY: F_GETFL takes no pointer arguments.
            assert_ne!(0, unsafe { libc::fcntl(copy, libc::F_GETFL) } & libc::O_NONBLOCK);
            assert_eq!(0, fcntl(copy, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK);

            close(wr).unwrap();
            copy
        });

        assert_eq!(0, unsafe { libc::fcntl(copy, libc::F_GETFL) } & libc::O_NONBLOCK);
        close(copy).unwrap();
    }

    #[test]
    fn test_write_all() {
        test_util::run(|| {
            let (rd, wr) = pipe().unwrap();
            let data: Vec<u8> = (0..256 * 1024).map(|i| i as u8).collect();

            let writer = {
                let data = data.clone();
                thread::spawn(move || write(wr, &data).unwrap()).unwrap()
            };

            let mut received = Vec::new();
            let mut buf = [0; 4096];
            while received.len() < data.len() {
                let n = read(rd, &mut buf).unwrap();
                received.extend_from_slice(&buf[..n]);
            }

            assert_eq!(data.len(), writer.join().unwrap());
            assert!(received == data);

            close(rd).unwrap();
            close(wr).unwrap();
        });
    }

    #[test]
    fn test_user_nonblocking() {
        test_util::run(|| {
            let (rd, wr) = pipe().unwrap();
            let flags = fcntl(rd, libc::F_GETFL, 0).unwrap();

            assert_eq!(0, flags & libc::O_NONBLOCK);
            fcntl(rd, libc::F_SETFL, flags | libc::O_NONBLOCK).unwrap();
            assert_ne!(0, fcntl(rd, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK);

            let mut buf = [0; 4];
            assert_eq!(io::ErrorKind::WouldBlock, read(rd, &mut buf).unwrap_err().kind());

            fcntl(rd, libc::F_SETFL, flags).unwrap();
            assert_eq!(0, fcntl(rd, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK);

            close(rd).unwrap();
            close(wr).unwrap();
        });
    }

    #[test]
    fn test_poll() {
        test_util::run(|| {
            let (rd, wr) = pipe().unwrap();
            let mut fds = [libc::pollfd {
                fd: rd,
                events: libc::POLLIN,
                revents: 0
            }];

            let start = Instant::now();
            assert_eq!(0, poll(&mut fds, Some(Duration::from_millis(20))).unwrap());
            assert!(start.elapsed() >= Duration::from_millis(20));

            let writer = thread::spawn(move || write(wr, b"x").unwrap()).unwrap();

            assert_eq!(1, poll(&mut fds, None).unwrap());
            assert_ne!(0, fds[0].revents & libc::POLLIN);
            assert_eq!(1, writer.join().unwrap());

            close(rd).unwrap();
            close(wr).unwrap();
        });
    }

    #[test]
    fn test_poll_empty() {
        test_util::run(|| {
            let sleeper = thread::spawn(|| {
                let start = Instant::now();
                let ready = poll(&mut [], Some(Duration::from_millis(20))).unwrap();

                (ready, start.elapsed())
            })
            .unwrap();

            thread::yield_now();
            assert_eq!(Some(thread::ThreadState::BlockedOnIo), sleeper.thread().state());
            assert!(!Scheduler::current().files.has_waiters());

            let (ready, elapsed) = sleeper.join().unwrap();
            assert_eq!(0, ready);
            assert!(elapsed >= Duration::from_millis(20));
        });
    }

    #[test]
    fn test_poll_timeout_ms() {
        assert_eq!(-1, poll_timeout_ms(None));
        assert_eq!(0, poll_timeout_ms(Some(Duration::ZERO)));
        assert_eq!(1, poll_timeout_ms(Some(Duration::from_micros(200))));
        assert_eq!(3, poll_timeout_ms(Some(Duration::from_micros(2001))));
        assert_eq!(libc::c_int::MAX, poll_timeout_ms(Some(Duration::MAX)));

        let start = Instant::now();
        assert_eq!(0, poll(&mut [], Some(Duration::from_micros(500))).unwrap());
        assert!(start.elapsed() >= Duration::from_micros(500));
    }

    #[test]
    fn test_lock_fd() {
        test_util::run(|| {
            let (rd, wr) = pipe().unwrap();
            let guard = lock_fd(wr, Interest::WRITE, None).unwrap();

            let child = thread::spawn(move || {
                let timed_out = lock_fd(wr, Interest::WRITE, Some(Duration::from_millis(10))).err().map(|err| err.kind());
                let written = write(wr, b"after").unwrap();

                (timed_out, written)
            })
            .unwrap();

            thread::sleep(Duration::from_millis(30));
            assert_eq!(1, write(wr, b"first").map(|n| n / 5).unwrap());
            drop(guard);

            assert_eq!((Some(io::ErrorKind::TimedOut), 5), child.join().unwrap());

            let mut buf = [0; 10];
            assert_eq!(10, read(rd, &mut buf).unwrap());
            assert_eq!(b"firstafter", &buf);

            close(rd).unwrap();
            close(wr).unwrap();
        });
    }

    #[test]
    fn test_close_wakes_waiters() {
        test_util::run(|| {
            let (rd, wr) = pipe().unwrap();
            let guard = lock_fd(rd, Interest::READ, None).unwrap();

            let child = thread::spawn(move || lock_fd(rd, Interest::READ, None).err().and_then(|err| err.raw_os_error())).unwrap();

            thread::yield_now();
            std::mem::forget(guard);
            close(rd).unwrap();

            assert_eq!(Some(libc::EBADF), child.join().unwrap());
            close(wr).unwrap();
        });
    }

    #[test]
    fn test_outside_runtime() {
        let (rd, wr) = pipe().unwrap();

        assert_eq!(3, write(wr, b"abc").unwrap());

        let mut buf = [0; 3];
        assert_eq!(3, read(rd, &mut buf).unwrap());
        assert_eq!(b"abc", &buf);

        close(rd).unwrap();
        close(wr).unwrap();
    }
}
