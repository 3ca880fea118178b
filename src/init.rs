//! One-time initialization that tolerates being re-entered from its own initializer.
//!
//! Resolving symbols through the dynamic loader may call `malloc`, which lands back in the
//! interposer before it has anything to delegate to.  [`LazyInit`] holds a usable fallback value
//! from the start; a call that re-enters on the initializing thread gets that fallback instead of
//! deadlocking on its own lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::sync::ErrorCheckMutex;

const NOT_STARTED: u8 = 0;
const IN_PROGRESS: u8 = 1;
const DONE: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitState {
    NotStarted,
    InProgress,
    Done,
}

pub struct LazyInit<T> {
    state: AtomicU8,
    lock: ErrorCheckMutex,
    // Written once, under `lock`, before `state` becomes DONE.
    value: UnsafeCell<T>,
}

unsafe impl<T: Send + Sync> Sync for LazyInit<T> {}

impl<T> LazyInit<T> {
    /// `fallback` is what callers see until initialization completes.
    pub const fn new(fallback: T) -> Self {
        LazyInit {
            state: AtomicU8::new(NOT_STARTED),
            lock: ErrorCheckMutex::new(),
            value: UnsafeCell::new(fallback),
        }
    }

    /// Run `init` exactly once and return the installed value.
    ///
    /// A call made from inside `init` on the same thread returns the fallback value
    /// immediately.  Every other caller blocks until `init` has finished.
    #[inline]
    pub fn ensure_ready<F: FnOnce() -> T>(&self, init: F) -> &T {
        if self.state.load(Ordering::Acquire) != DONE {
            self.initialize(init);
        }
        // Either DONE was observed with Acquire, or this thread is the initializer and
        // nothing else can be writing.
        unsafe { &*self.value.get() }
    }

    #[cold]
    #[inline(never)]
    fn initialize<F: FnOnce() -> T>(&self, init: F) {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(_) => {
                crate::ksmp_debug!("re-entered during setup, using fallbacks");
                return;
            }
        };
        // Another thread may have finished while we waited.
        if self.state.load(Ordering::Acquire) == DONE {
            return;
        }
        self.state.store(IN_PROGRESS, Ordering::Relaxed);
        let value = init();
        // Re-entrant callers only borrow the fallback for the duration of their own call,
        // which has returned by the time `init` does.
        unsafe { *self.value.get() = value };
        self.state.store(DONE, Ordering::Release);
    }

    pub fn state(&self) -> InitState {
        match self.state.load(Ordering::Acquire) {
            NOT_STARTED => InitState::NotStarted,
            IN_PROGRESS => InitState::InProgress,
            _ => InitState::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Table([usize; 5]);

    const FALLBACK: Table = Table([0; 5]);
    const RESOLVED: Table = Table([1, 2, 3, 4, 5]);

    #[test]
    fn initializes_once() {
        let cell = LazyInit::new(FALLBACK);
        let calls = AtomicUsize::new(0);
        assert_eq!(cell.state(), InitState::NotStarted);
        for _ in 0..3 {
            let value = cell.ensure_ready(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                RESOLVED
            });
            assert_eq!(*value, RESOLVED);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cell.state(), InitState::Done);
    }

    #[test]
    fn concurrent_first_callers_initialize_once() {
        static CELL: LazyInit<Table> = LazyInit::new(FALLBACK);
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        const THREADS: usize = 32;

        let barrier = Barrier::new(THREADS);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    barrier.wait();
                    let value = CELL.ensure_ready(|| {
                        CALLS.fetch_add(1, Ordering::SeqCst);
                        thread::yield_now();
                        RESOLVED
                    });
                    // Never a torn or partially resolved table.
                    assert_eq!(*value, RESOLVED);
                });
            }
        });
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentry_returns_fallback_without_deadlock() {
        static CELL: LazyInit<Table> = LazyInit::new(FALLBACK);
        static NESTED_CALLS: AtomicUsize = AtomicUsize::new(0);

        let value = CELL.ensure_ready(|| {
            assert_eq!(CELL.state(), InitState::InProgress);
            let nested = CELL.ensure_ready(|| {
                NESTED_CALLS.fetch_add(1, Ordering::SeqCst);
                Table([9; 5])
            });
            assert_eq!(*nested, FALLBACK);
            assert_eq!(CELL.state(), InitState::InProgress);
            RESOLVED
        });
        assert_eq!(*value, RESOLVED);
        assert_eq!(NESTED_CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(CELL.state(), InitState::Done);
    }
}
