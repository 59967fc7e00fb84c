//! Snapshot lock with writer drain.
//!
//! Readers take an `Arc` snapshot and never block each other. A writer
//! waits for in-flight readers to finish, then mutates in place. New
//! readers are not held back while a writer waits, so a steady stream of
//! readers can starve writers.

use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::Arc;

struct DrainState<T> {
    value: Arc<T>,
    iterators: usize,
    writers_waiting: usize,
}

/// Lock guarding a shared list that is mostly iterated and rarely edited.
pub struct DrainLock<T> {
    state: Mutex<DrainState<T>>,
    drained: Condvar,
}

impl<T: Clone> DrainLock<T> {
    /// Wrap an initial value.
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(DrainState {
                value: Arc::new(value),
                iterators: 0,
                writers_waiting: 0,
            }),
            drained: Condvar::new(),
        }
    }

    /// Begin an iteration. The snapshot stays valid until the guard drops.
    pub fn read(&self) -> DrainGuard<'_, T> {
        let mut state = self.state.lock();
        state.iterators += 1;
        DrainGuard {
            lock: self,
            snapshot: Arc::clone(&state.value),
        }
    }

    /// Snapshot without counting as an iterator.
    pub fn snapshot(&self) -> Arc<T> {
        Arc::clone(&self.state.lock().value)
    }

    /// Mutate once every in-flight iteration has finished.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut state = self.state.lock();
        while state.iterators > 0 {
            state.writers_waiting += 1;
            self.drained.wait(&mut state);
            state.writers_waiting -= 1;
        }
        f(Arc::make_mut(&mut state.value))
    }

    /// Number of iterations in flight.
    pub fn iterators(&self) -> usize {
        self.state.lock().iterators
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.iterators -= 1;
        if state.iterators == 0 && state.writers_waiting > 0 {
            self.drained.notify_all();
        }
    }
}

/// An in-flight iteration over a [`DrainLock`].
pub struct DrainGuard<'a, T: Clone> {
    lock: &'a DrainLock<T>,
    snapshot: Arc<T>,
}

impl<T: Clone> Deref for DrainGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.snapshot
    }
}

impl<T: Clone> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_readers_see_snapshot() {
        let lock = DrainLock::new(vec![1, 2, 3]);
        let snapshot = lock.snapshot();
        lock.write(|v| v.push(4));
        assert_eq!(*snapshot, vec![1, 2, 3]);
        assert_eq!(*lock.read(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let lock = Arc::new(DrainLock::new(0u32));
        let written = Arc::new(AtomicBool::new(false));

        let guard = lock.read();
        assert_eq!(lock.iterators(), 1);

        let writer = {
            let lock = Arc::clone(&lock);
            let written = Arc::clone(&written);
            thread::spawn(move || {
                lock.write(|v| *v += 1);
                written.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!written.load(Ordering::SeqCst));
        drop(guard);

        writer.join().unwrap();
        assert!(written.load(Ordering::SeqCst));
        assert_eq!(*lock.read(), 1);
        assert_eq!(lock.iterators(), 0);
    }
}
