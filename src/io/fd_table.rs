//! The table of file descriptors used through the runtime's I/O wrappers.
//!
//! Descriptors that can block (pipes, sockets, terminals) are switched to non-blocking mode in the kernel the first time they are used,
//! so that a thread waiting for one of them can be suspended while the others keep running. The status flags the program itself asked for
//! are remembered and reported by [`fcntl`](super::fcntl), and put back when the descriptor is closed or the runtime shuts down.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use super::Interest;
use crate::sched::task::{Location, Thread, ThreadId, ThreadState};
use crate::sched::Scheduler;
use crate::sync::critical::CriticalLock;

/// How a descriptor behaves when there is nothing to read or no room to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// Regular files, directories and block devices. Operations on them never report `EAGAIN`, so they are used as-is.
    HalfDuplex,
    /// Pipes, sockets, terminals and other character devices. Kept non-blocking in the kernel.
    FullDuplex
}

#[derive(Default)]
pub(super) struct FdDirection {
    pub ready_waiters: VecDeque<Rc<Thread>>,
    owner: Option<ThreadId>,
    lock_count: usize,
    lock_waiters: VecDeque<Rc<Thread>>
}

impl FdDirection {
    fn take_waiters(&mut self) -> impl Iterator<Item = Rc<Thread>> {
        mem::take(&mut self.ready_waiters).into_iter().chain(mem::take(&mut self.lock_waiters))
    }
}

pub(super) struct FdEntry {
    pub kind: FdKind,
    /// Descriptors created from each other by `dup` share an open file description, and with it their status flags.
    pub description: u64,
    pub user_flags: libc::c_int,
    pub read: FdDirection,
    pub write: FdDirection
}

impl FdEntry {
    pub fn direction(&mut self, interest: Interest) -> &mut FdDirection {
        if interest == Interest::WRITE {
            &mut self.write
        } else {
            &mut self.read
        }
    }

    /// Whether operations should wait for readiness rather than fail with `EAGAIN`.
    pub fn blocks(&self) -> bool {
        self.kind == FdKind::FullDuplex && self.user_flags & libc::O_NONBLOCK == 0
    }
}

pub(super) struct PollWaiter {
    pub thread: Rc<Thread>,
    pub fds: Vec<libc::pollfd>
}

#[derive(Default)]
pub(super) struct FileTableInner {
    pub entries: BTreeMap<RawFd, FdEntry>,
    pub poll_waiters: Vec<PollWaiter>,
    next_description: u64
}

impl FileTableInner {
    fn insert(&mut self, fd: RawFd, kind: FdKind, description: u64, user_flags: libc::c_int) {
        self.entries.insert(fd, FdEntry {
            kind,
            description,
            user_flags,
            read: FdDirection::default(),
            write: FdDirection::default()
        });
    }

    fn is_shared(&self, description: u64) -> bool {
        self.entries.values().any(|entry| entry.description == description)
    }
}

pub(crate) struct FileTable {
    pub(super) inner: CriticalLock<FileTableInner>
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn get_flags(fd: RawFd) -> io::Result<libc::c_int> {
    // SAFETY: F_GETFL takes no pointer arguments.
    cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })
}

fn set_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    // SAFETY: F_SETFL takes no pointer arguments.
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(drop)
}

fn bad_fd() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

impl FileTable {
    pub fn new() -> FileTable {
        FileTable {
            inner: CriticalLock::new(FileTableInner::default())
        }
    }

    /// Starts tracking `fd` if it is not tracked yet, classifying it and making it non-blocking if it can block.
    pub fn register(&self, fd: RawFd) -> io::Result<FdKind> {
        if let Some(entry) = self.inner.lock().entries.get(&fd) {
            return Ok(entry.kind);
        }

        // SAFETY: stat is plain old data and fstat only writes to it.
        let mut stat: libc::stat = unsafe { mem::zeroed() };
        cvt(unsafe { libc::fstat(fd, &mut stat) })?;

        let kind = match stat.st_mode & libc::S_IFMT {
            libc::S_IFREG | libc::S_IFDIR | libc::S_IFBLK => FdKind::HalfDuplex,
            _ => FdKind::FullDuplex
        };

        let user_flags = get_flags(fd)?;

        if kind == FdKind::FullDuplex && user_flags & libc::O_NONBLOCK == 0 {
            set_flags(fd, user_flags | libc::O_NONBLOCK)?;
        }

        log::debug!("Tracking fd {} as {:?}", fd, kind);

        let mut inner = self.inner.lock();
        let description = inner.next_description;

        inner.next_description += 1;
        inner.insert(fd, kind, description, user_flags);
        Ok(kind)
    }

    /// Tracks `new`, a duplicate of the tracked descriptor `old`, as sharing `old`'s status flags. The kernel flags of a duplicate already
    /// include the runtime's `O_NONBLOCK`, so `new` must not be classified on its own.
    pub fn register_dup(&self, old: RawFd, new: RawFd) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let (kind, description, user_flags) = match inner.entries.get(&old) {
            Some(entry) => (entry.kind, entry.description, entry.user_flags),
            None => return Err(bad_fd())
        };

        log::debug!("Tracking fd {} as a duplicate of fd {}", new, old);
        inner.insert(new, kind, description, user_flags);
        Ok(())
    }

    pub fn blocks(&self, fd: RawFd) -> bool {
        self.inner.lock().entries.get(&fd).map_or(false, FdEntry::blocks)
    }

    /// The status flags as the program sees them, if `fd` is tracked.
    pub fn user_flags(&self, fd: RawFd) -> Option<libc::c_int> {
        self.inner.lock().entries.get(&fd).map(|entry| entry.user_flags)
    }

    /// Records new status flags for `fd`, keeping the kernel descriptor non-blocking if the runtime relies on that.
    pub fn set_user_flags(&self, fd: RawFd, flags: libc::c_int) -> io::Result<()> {
        let kind = self.register(fd)?;
        let kernel_flags = match kind {
            FdKind::FullDuplex => flags | libc::O_NONBLOCK,
            FdKind::HalfDuplex => flags
        };

        set_flags(fd, kernel_flags)?;

        let mut inner = self.inner.lock();
        if let Some(description) = inner.entries.get(&fd).map(|entry| entry.description) {
            for entry in inner.entries.values_mut().filter(|entry| entry.description == description) {
                entry.user_flags = flags;
            }
        }

        Ok(())
    }

    /// Takes the current thread's lock on the directions of `fd` named by `interest`. Locks nest: a thread already holding a direction
    /// just increments its count. Waits for other holders in FIFO order, giving up with `TimedOut` once `deadline` passes.
    pub fn lock(&self, sched: &Scheduler, fd: RawFd, interest: Interest, deadline: Option<Instant>) -> io::Result<()> {
        self.register(fd)?;

        let mut acquired = Interest::empty();

        for direction in interest.iter() {
            if let Err(err) = self.lock_direction(sched, fd, direction, deadline) {
                self.unlock(sched, fd, acquired);
                return Err(err);
            }

            acquired |= direction;
        }

        Ok(())
    }

    fn lock_direction(&self, sched: &Scheduler, fd: RawFd, interest: Interest, deadline: Option<Instant>) -> io::Result<()> {
        let me = sched.current_thread();

        {
            let mut inner = self.inner.lock();
            let dir = inner.entries.get_mut(&fd).ok_or_else(bad_fd)?.direction(interest);

            match dir.owner {
                None => {
                    dir.owner = Some(me.id());
                    dir.lock_count = 1;
                    return Ok(());
                },
                Some(owner) if owner == me.id() => {
                    dir.lock_count += 1;
                    return Ok(());
                },
                Some(_) => {
                    let location = Location::FdLockWait(fd, interest);
                    dir.lock_waiters.push_back(sched.block_current(ThreadState::BlockedOnLock, location, deadline));
                }
            }
        }

        sched.schedule();

        let timed_out = me.take_timed_out();
        let mut inner = self.inner.lock();
        let dir = inner.entries.get_mut(&fd).ok_or_else(bad_fd)?.direction(interest);

        if dir.owner == Some(me.id()) {
            Ok(())
        } else if timed_out {
            dir.lock_waiters.retain(|thread| thread.id() != me.id());
            Err(io::Error::from(io::ErrorKind::TimedOut))
        } else {
            Err(bad_fd())
        }
    }

    /// Drops one level of the current thread's lock on the directions of `fd` named by `interest`, handing each fully released direction
    /// to its first waiter.
    pub fn unlock(&self, sched: &Scheduler, fd: RawFd, interest: Interest) {
        let me = sched.current_thread();

        for direction in interest.iter() {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&fd) else {
                return;
            };
            let dir = entry.direction(direction);

            if dir.owner != Some(me.id()) {
                continue;
            }

            dir.lock_count -= 1;
            if dir.lock_count > 0 {
                continue;
            }

            dir.owner = None;

            // Hand the lock over while the table is locked, so no other thread can take it first.
            while let Some(next) = dir.lock_waiters.pop_front() {
                if sched.wake(&next, |loc| loc == Location::FdLockWait(fd, direction)) {
                    dir.owner = Some(next.id());
                    dir.lock_count = 1;
                    break;
                }
            }
        }
    }

    /// Forgets `fd`, restoring its status flags unless a tracked duplicate still needs them, and waking every thread waiting on it, then
    /// closes it. The caller must hold both of its locks.
    pub fn close(&self, sched: &Scheduler, fd: RawFd) -> io::Result<()> {
        let (entry, shared) = self.inner.with_lock(|inner| {
            let entry = inner.entries.remove(&fd);
            let shared = entry.as_ref().map_or(false, |entry| inner.is_shared(entry.description));

            (entry, shared)
        });

        if let Some(mut entry) = entry {
            if entry.kind == FdKind::FullDuplex && !shared {
                let _ = set_flags(fd, entry.user_flags);
            }

            let waiters: Vec<_> = entry.read.take_waiters().chain(entry.write.take_waiters()).collect();
            for thread in waiters {
                sched.wake(&thread, |loc| matches!(loc, Location::IoWait(wfd, _) | Location::FdLockWait(wfd, _) if wfd == fd));
            }

            log::debug!("Closing fd {}", fd);
        }

        // SAFETY: close has no memory safety requirements.
        cvt(unsafe { libc::close(fd) }).map(drop)
    }

    /// Puts back the status flags of every tracked descriptor, so that descriptors shared with other processes are left as found.
    pub fn restore_flags(&self) {
        let entries = mem::take(&mut self.inner.lock().entries);

        for (fd, entry) in entries {
            if entry.kind == FdKind::FullDuplex {
                if let Err(err) = set_flags(fd, entry.user_flags) {
                    log::debug!("Failed to restore flags of fd {}: {}", fd, err);
                }
            }
        }
    }
}
