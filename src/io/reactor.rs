//! Readiness waiting for threads blocked on file descriptors.
//!
//! Threads never call `poll` themselves to wait. They register what they wait for here and suspend, and the scheduler polls for all of
//! them at once whenever it picks the next thread to run.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use super::fd_table::{FileTable, PollWaiter};
use super::Interest;
use crate::sched::task::{Location, Thread, ThreadState};
use crate::sched::Scheduler;

const ERROR_EVENTS: libc::c_short = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

fn events(interest: Interest) -> libc::c_short {
    let mut events = 0;

    if interest.contains(Interest::READ) {
        events |= libc::POLLIN;
    }

    if interest.contains(Interest::WRITE) {
        events |= libc::POLLOUT;
    }

    events
}

/// Whether `revents` satisfies a wait for `events`. Hangups and errors satisfy every wait, so the waiter sees the failure itself.
fn is_ready(events: libc::c_short, revents: libc::c_short) -> bool {
    revents & (events | ERROR_EVENTS) != 0
}

impl FileTable {
    /// Suspends the current thread until `fd` may be ready for the operation named by `interest`. Wakeups may be spurious: the caller must
    /// retry the operation and wait again if it would still block.
    pub(crate) fn wait_ready(&self, sched: &Scheduler, fd: RawFd, interest: Interest) {
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&fd) else {
                return;
            };

            let thread = sched.block_current(ThreadState::BlockedOnIo, Location::IoWait(fd, interest), None);
            entry.direction(interest).ready_waiters.push_back(thread);
        }

        sched.schedule();
    }

    /// Suspends the current thread until any of `fds` may be ready or `deadline` passes. Returns `true` if the deadline passed.
    pub(crate) fn wait_poll(&self, sched: &Scheduler, fds: &[libc::pollfd], deadline: Option<Instant>) -> bool {
        self.wait_any(sched, fds, deadline, ThreadState::BlockedOnIo, Location::PollWait)
    }

    /// Suspends the current thread until the signalfd `fd` may have a signal to read.
    pub(crate) fn wait_signal(&self, sched: &Scheduler, fd: RawFd) {
        let fds = [libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0
        }];

        self.wait_any(sched, &fds, None, ThreadState::BlockedOnSignal, Location::SignalWait);
    }

    fn wait_any(&self, sched: &Scheduler, fds: &[libc::pollfd], deadline: Option<Instant>, state: ThreadState, location: Location) -> bool {
        let thread = sched.block_current(state, location, deadline);
        let id = thread.id();

        self.inner.lock().poll_waiters.push(PollWaiter {
            thread,
            fds: fds.to_vec()
        });
        sched.schedule();

        let timed_out = sched.current_thread().take_timed_out();
        self.inner.lock().poll_waiters.retain(|waiter| waiter.thread.id() != id);
        timed_out
    }

    /// Whether any thread waits for a descriptor. A poll of an empty set can only end by its deadline, so it does not count.
    pub(crate) fn has_waiters(&self) -> bool {
        let inner = self.inner.lock();

        inner.poll_waiters.iter().any(|waiter| !waiter.fds.is_empty())
            || inner.entries.values().any(|entry| !entry.read.ready_waiters.is_empty() || !entry.write.ready_waiters.is_empty())
    }

    /// Builds the set of descriptors to poll for every waiting thread.
    pub(crate) fn poll_set(&self) -> Vec<libc::pollfd> {
        let inner = self.inner.lock();
        let mut fds = Vec::new();

        for (&fd, entry) in inner.entries.iter() {
            let mut interest = Interest::empty();

            if !entry.read.ready_waiters.is_empty() {
                interest |= Interest::READ;
            }

            if !entry.write.ready_waiters.is_empty() {
                interest |= Interest::WRITE;
            }

            if !interest.is_empty() {
                fds.push(libc::pollfd {
                    fd,
                    events: events(interest),
                    revents: 0
                });
            }
        }

        for waiter in inner.poll_waiters.iter() {
            fds.extend(waiter.fds.iter().map(|pfd| libc::pollfd { revents: 0, ..*pfd }));
        }

        fds
    }

    /// Takes every thread whose wait is satisfied by the results of polling a set built by [`FileTable::poll_set`].
    pub(crate) fn dispatch(&self, fds: &[libc::pollfd]) -> Vec<Rc<Thread>> {
        let mut ready: BTreeMap<RawFd, libc::c_short> = BTreeMap::new();

        for pfd in fds.iter().filter(|pfd| pfd.revents != 0) {
            *ready.entry(pfd.fd).or_default() |= pfd.revents;
        }

        let mut woken = Vec::new();
        let mut inner = self.inner.lock();

        for (fd, &revents) in ready.iter() {
            if let Some(entry) = inner.entries.get_mut(fd) {
                if is_ready(libc::POLLIN, revents) {
                    woken.extend(entry.read.ready_waiters.drain(..));
                }

                if is_ready(libc::POLLOUT, revents) {
                    woken.extend(entry.write.ready_waiters.drain(..));
                }
            }
        }

        let (done, waiting) = std::mem::take(&mut inner.poll_waiters).into_iter().partition::<Vec<_>, _>(|waiter| {
            waiter
                .fds
                .iter()
                .any(|pfd| ready.get(&pfd.fd).map_or(false, |&revents| is_ready(pfd.events, revents)))
        });

        inner.poll_waiters = waiting;
        woken.extend(done.into_iter().map(|waiter| waiter.thread));

        if !woken.is_empty() {
            log::trace!("{} thread(s) ready after poll", woken.len());
        }

        woken
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_ready() {
        assert!(is_ready(libc::POLLIN, libc::POLLIN));
        assert!(!is_ready(libc::POLLIN, libc::POLLOUT));
        assert!(is_ready(libc::POLLOUT, libc::POLLHUP));
        assert!(is_ready(0, libc::POLLNVAL));
    }

    #[test]
    fn test_events() {
        assert_eq!(libc::POLLIN | libc::POLLOUT, events(Interest::READ | Interest::WRITE));
        assert_eq!(0, events(Interest::empty()));
    }
}
