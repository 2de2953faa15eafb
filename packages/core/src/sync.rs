// ============================================================================
// File: packages/core/src/sync.rs
// ----------------------------------------------------------------------------
// A writer-priority, deadline-bounded reader/writer lock.
//
// std::sync::RwLock makes no fairness guarantee and has no timed variant, so
// it cannot honor the "queued writers block new readers" ordering guarantee
// nor the "every wait is bounded by the ambient deadline" rule the rest of
// the kernel relies on. This is the one hand-built primitive the kernel
// depends on for both the module loader's per-module lock and
// RequestContext::acquire.
// ============================================================================

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct RwState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

/// A reader/writer lock where a waiting writer blocks new readers from
/// entering, and every acquisition is bounded by an explicit timeout rather
/// than blocking indefinitely.
pub struct DeadlineRwLock<T> {
    state: Mutex<RwState>,
    released: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for DeadlineRwLock<T> {}
unsafe impl<T: Send> Sync for DeadlineRwLock<T> {}

impl<T> DeadlineRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(RwState {
                readers: 0,
                writer: false,
                waiting_writers: 0,
            }),
            released: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire a shared (read) guard, waiting at most `timeout`. Returns
    /// `None` if the timeout elapses first: `None` carries the same "you did
    /// not get the lock" meaning a boolean flag would, without an extra
    /// out-of-band value.
    pub fn read(&self, timeout: Duration) -> Option<RwReadGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if !state.writer && state.waiting_writers == 0 {
                state.readers += 1;
                return Some(RwReadGuard { lock: self });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, timeout_result) = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if timeout_result.timed_out() && Instant::now() >= deadline {
                return None;
            }
        }
    }

    /// Acquire an exclusive (write) guard, waiting at most `timeout`.
    pub fn write(&self, timeout: Duration) -> Option<RwWriteGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiting_writers += 1;
        let acquired = loop {
            if !state.writer && state.readers == 0 {
                state.writer = true;
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            let (guard, _) = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        };
        state.waiting_writers -= 1;
        drop(state);
        if acquired {
            Some(RwWriteGuard { lock: self })
        } else {
            None
        }
    }
}

pub struct RwReadGuard<'a, T> {
    lock: &'a DeadlineRwLock<T>,
}

impl<T> Deref for RwReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap_or_else(|e| e.into_inner());
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.released.notify_all();
        }
    }
}

pub struct RwWriteGuard<'a, T> {
    lock: &'a DeadlineRwLock<T>,
}

impl<T> Deref for RwWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap_or_else(|e| e.into_inner());
        state.writer = false;
        self.lock.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn read_is_concurrent() {
        let lock = Arc::new(DeadlineRwLock::new(42));
        let a = lock.read(Duration::from_secs(1)).unwrap();
        let b = lock.read(Duration::from_secs(1)).unwrap();
        assert_eq!(*a, 42);
        assert_eq!(*b, 42);
    }

    #[test]
    fn write_excludes_readers() {
        let lock = DeadlineRwLock::new(0);
        let _w = lock.write(Duration::from_secs(1)).unwrap();
        assert!(lock.read(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let lock = Arc::new(DeadlineRwLock::new(0));
        let _r1 = lock.read(Duration::from_secs(1)).unwrap();

        let lock2 = Arc::clone(&lock);
        let writer_started = Arc::new(std::sync::Barrier::new(2));
        let writer_started2 = Arc::clone(&writer_started);
        let handle = thread::spawn(move || {
            writer_started2.wait();
            lock2.write(Duration::from_millis(500)).is_some()
        });
        writer_started.wait();
        thread::sleep(Duration::from_millis(50));

        // a new reader arriving while a writer is queued must not jump ahead
        assert!(lock.read(Duration::from_millis(50)).is_none());
        drop(_r1);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn write_times_out() {
        let lock = DeadlineRwLock::new(0);
        let _w = lock.write(Duration::from_secs(1)).unwrap();
        assert!(lock.write(Duration::from_millis(50)).is_none());
    }
}
