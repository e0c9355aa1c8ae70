use std::collections::VecDeque;
use std::rc::Rc;

use super::task::{Location, Thread};
use crate::util::fatal;

/// The FIFO queue of runnable threads.
#[derive(Default)]
pub(crate) struct RunQueue {
    queue: VecDeque<Rc<Thread>>
}

impl RunQueue {
    pub fn push(&mut self, thread: Rc<Thread>) {
        self.queue.push_back(thread);
    }

    pub fn pop(&mut self) -> Option<Rc<Thread>> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Thread>> {
        self.queue.iter()
    }

    /// Checks that every queued thread is marked as being on the run queue, exactly once.
    pub fn check(&self) {
        for (i, thread) in self.queue.iter().enumerate() {
            let location = thread.lock().location;

            if location != Location::RunQueue {
                fatal!("{} is on the run queue but its location is {:?}", thread.debug_name(), location);
            }

            if self.queue.iter().skip(i + 1).any(|other| Rc::ptr_eq(thread, other)) {
                fatal!("{} is on the run queue more than once", thread.debug_name());
            }
        }
    }
}
