//! Thread-specific data.
//!
//! A [`Key`] names a slot that every thread of a runtime can store its own value in. Keys come from a fixed table of [`KEYS_MAX`] slots;
//! when a key is deleted its slot can be reused, and the generation stored in the key keeps the new key from seeing values stored under
//! the old one.

use std::any::Any;
use std::mem;

use crate::error::{Error, Result};
use crate::sched::task::Thread;
use crate::sched::Scheduler;
use crate::sync::critical::CriticalLock;

pub const KEYS_MAX: usize = 256;

pub type SpecificValue = Box<dyn Any>;

/// Called with a thread's value for a key when the thread exits.
pub type Destructor = fn(SpecificValue);

/// A thread-specific data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: usize,
    generation: u64
}

#[derive(Default)]
struct KeySlot {
    allocated: bool,
    generation: u64,
    count: usize,
    destructor: Option<Destructor>
}

impl KeySlot {
    fn matches(&self, generation: u64) -> bool {
        self.allocated && self.generation == generation
    }
}

pub(crate) struct KeyRegistry {
    slots: Box<[CriticalLock<KeySlot>]>
}

impl KeyRegistry {
    pub fn new() -> KeyRegistry {
        KeyRegistry {
            slots: (0..KEYS_MAX).map(|_| CriticalLock::new(KeySlot::default())).collect()
        }
    }

    fn slot(&self, key: Key) -> Result<&CriticalLock<KeySlot>> {
        let slot = self.slots.get(key.index).ok_or(Error::InvalidArgument)?;

        if slot.lock().matches(key.generation) {
            Ok(slot)
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Accounts for a thread dropping its value stored under `generation` in slot `index`. Returns the destructor to call on the value, if
    /// the key it was stored under still exists.
    fn release_value(&self, index: usize, generation: u64) -> Option<Destructor> {
        let mut slot = self.slots[index].lock();

        if slot.matches(generation) {
            slot.count = slot.count.saturating_sub(1);
            slot.destructor
        } else {
            None
        }
    }
}

/// The values a thread has stored, indexed by key slot.
#[derive(Default)]
pub(crate) struct SpecificValues {
    values: Vec<Option<(u64, SpecificValue)>>
}

impl SpecificValues {
    fn get(&self, key: Key) -> Option<&SpecificValue> {
        match self.values.get(key.index) {
            Some(Some((generation, value))) if *generation == key.generation => Some(value),
            _ => None
        }
    }

    fn replace(&mut self, key: Key, value: Option<SpecificValue>) -> Option<(u64, SpecificValue)> {
        if self.values.len() <= key.index {
            if value.is_none() {
                return None;
            }

            self.values.resize_with(key.index + 1, || None);
        }

        mem::replace(&mut self.values[key.index], value.map(|value| (key.generation, value)))
    }
}

/// Allocates a new key. When a thread exits with a value stored under the key, `destructor` is called with it.
///
/// Fails with [`Error::ResourceExhausted`] once all [`KEYS_MAX`] keys are in use.
pub fn key_create(destructor: Option<Destructor>) -> Result<Key> {
    let sched = Scheduler::current();

    for (index, slot) in sched.keys.slots.iter().enumerate() {
        let mut slot = slot.lock();

        if !slot.allocated {
            slot.allocated = true;
            slot.generation += 1;
            slot.count = 0;
            slot.destructor = destructor;

            log::debug!("Allocated thread-specific data key {}", index);
            return Ok(Key {
                index,
                generation: slot.generation
            });
        }
    }

    Err(Error::ResourceExhausted)
}

/// Frees a key. Values threads stored under it stay where they are, but can no longer be reached and are dropped without calling the
/// destructor when their thread exits.
pub fn key_delete(key: Key) -> Result<()> {
    let sched = Scheduler::current();
    let mut slot = sched.keys.slot(key)?.lock();

    if slot.count > 0 {
        log::debug!("Deleting thread-specific data key {} while {} thread(s) still hold values", key.index, slot.count);
    }

    slot.allocated = false;
    slot.destructor = None;
    Ok(())
}

/// Stores `value` as the current thread's value for `key`, or clears it if `value` is `None`. The previous value is dropped without calling
/// the destructor.
pub fn key_set(key: Key, value: Option<SpecificValue>) -> Result<()> {
    let sched = Scheduler::current();
    let slot = sched.keys.slot(key)?;
    let thread = sched.current_thread();

    let (had_value, has_value) = (thread.specific.borrow().get(key).is_some(), value.is_some());
    let old = thread.specific.borrow_mut().replace(key, value);

    if had_value != has_value {
        let mut slot = slot.lock();

        if has_value {
            slot.count += 1;
        } else {
            slot.count -= 1;
        }
    }

    drop(thread);
    drop(old);
    Ok(())
}

/// Gets a clone of the current thread's value for `key`. Returns `None` if the thread has no value for it, or the value is not a `T`.
pub fn key_get<T: Clone + 'static>(key: Key) -> Option<T> {
    key_with(key, |value: Option<&T>| value.cloned())
}

/// Calls `f` with a reference to the current thread's value for `key`, if it has one of type `T`. A deleted key has no values.
///
/// `f` must not call [`key_set`] or [`key_delete`].
///
/// # Panics
///
/// Panics if called outside a runtime.
pub fn key_with<T: 'static, R>(key: Key, f: impl FnOnce(Option<&T>) -> R) -> R {
    let sched = Scheduler::current();

    if sched.keys.slot(key).is_err() {
        return f(None);
    }

    let thread = sched.current_thread();
    let values = thread.specific.borrow();

    f(values.get(key).and_then(|value| value.downcast_ref::<T>()))
}

/// Calls the destructors of every value the exiting thread still holds. Destructors may store new values, so this is repeated up to the
/// configured number of passes; values left after the last pass are dropped without their destructor.
pub(crate) fn run_destructors(sched: &Scheduler, thread: &Thread) {
    let iterations = sched.config().destructor_iterations;

    for _ in 0..iterations {
        let values = mem::take(&mut thread.specific.borrow_mut().values);
        let mut called = false;

        for (index, entry) in values.into_iter().enumerate() {
            let Some((generation, value)) = entry else {
                continue;
            };

            match sched.keys.release_value(index, generation) {
                Some(destructor) => {
                    called = true;
                    destructor(value);
                },
                None => drop(value)
            }
        }

        if !called {
            break;
        }
    }

    let leftover = mem::take(&mut thread.specific.borrow_mut().values);
    let mut count = 0;

    for (index, (generation, value)) in leftover.into_iter().enumerate().filter_map(|(index, entry)| entry.map(|entry| (index, entry))) {
        sched.keys.release_value(index, generation);
        drop(value);
        count += 1;
    }

    if count > 0 {
        log::warn!("{} thread-specific value(s) remained after {} destructor pass(es)", count, iterations);
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use super::*;
    use crate::test_util;
    use crate::thread;

    thread_local! {
        static DESTRUCTOR_CALLS: Cell<usize> = const { Cell::new(0) };
        static RESET_KEY: Cell<Option<Key>> = const { Cell::new(None) };
    }

    fn count_destructor(value: SpecificValue) {
        assert!(value.downcast_ref::<u32>().is_some());
        DESTRUCTOR_CALLS.with(|calls| calls.set(calls.get() + 1));
    }

    fn resetting_destructor(value: SpecificValue) {
        count_destructor(value);

        if let Some(key) = RESET_KEY.with(Cell::get) {
            key_set(key, Some(Box::new(0u32))).unwrap();
        }
    }

    #[test]
    fn test_set_get() {
        test_util::run(|| {
            let key = key_create(None).unwrap();

            assert_eq!(None, key_get::<u32>(key));
            key_set(key, Some(Box::new(5u32))).unwrap();
            assert_eq!(Some(5u32), key_get(key));
            assert_eq!(None, key_get::<String>(key));
            assert_eq!(3, key_with(key, |val: Option<&u32>| val.map_or(0, |val| val - 2)));

            let child = thread::spawn(move || {
                let before = key_get::<u32>(key);

                key_set(key, Some(Box::new(7u32))).unwrap();
                (before, key_get::<u32>(key))
            })
            .unwrap();

            assert_eq!((None, Some(7)), child.join().unwrap());
            assert_eq!(Some(5u32), key_get(key));

            key_set(key, None).unwrap();
            assert_eq!(None, key_get::<u32>(key));
        });
    }

    #[test]
    fn test_destructor_at_exit() {
        test_util::run(|| {
            let key = key_create(Some(count_destructor)).unwrap();

            thread::spawn(move || key_set(key, Some(Box::new(1u32))).unwrap()).unwrap().join().unwrap();
            thread::spawn(|| ()).unwrap().join().unwrap();

            assert_eq!(1, DESTRUCTOR_CALLS.with(Cell::get));
        });
    }

    #[test]
    fn test_destructor_iterations() {
        test_util::run(|| {
            let key = key_create(Some(resetting_destructor)).unwrap();
            RESET_KEY.with(|reset| reset.set(Some(key)));

            thread::spawn(move || key_set(key, Some(Box::new(1u32))).unwrap()).unwrap().join().unwrap();

            assert_eq!(crate::runtime::DESTRUCTOR_ITERATIONS, DESTRUCTOR_CALLS.with(Cell::get));
        });
    }

    #[test]
    fn test_delete() {
        test_util::run(|| {
            let key = key_create(Some(count_destructor)).unwrap();

            key_set(key, Some(Box::new(1u32))).unwrap();
            key_delete(key).unwrap();

            assert!(matches!(key_delete(key), Err(Error::InvalidArgument)));
            assert!(matches!(key_set(key, None), Err(Error::InvalidArgument)));
            assert_eq!(None, key_get::<u32>(key));

            let reused = key_create(None).unwrap();
            assert_ne!(key, reused);
            assert_eq!(None, key_get::<u32>(reused));
            assert_eq!(None, key_get::<u32>(key));
        });

        assert_eq!(0, DESTRUCTOR_CALLS.with(Cell::get));
    }

    #[test]
    fn test_deleted_key_hides_values() {
        test_util::run(|| {
            let key = key_create(None).unwrap();

            let child = thread::spawn(move || {
                key_set(key, Some(Box::new(9u32))).unwrap();
                thread::yield_now();
                (key_get::<u32>(key), key_with(key, |value: Option<&u32>| value.is_some()))
            })
            .unwrap();

            thread::yield_now();
            key_delete(key).unwrap();

            assert_eq!((None, false), child.join().unwrap());
        });
    }

    #[test]
    fn test_exhausted() {
        test_util::run(|| {
            let keys: Vec<_> = (0..KEYS_MAX).map(|_| key_create(None).unwrap()).collect();

            assert!(matches!(key_create(None), Err(Error::ResourceExhausted)));
            key_delete(keys[10]).unwrap();
            assert!(key_create(None).is_ok());
        });
    }
}
