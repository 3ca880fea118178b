//! An error-checking mutex that never allocates.
//!
//! `std::sync::Mutex` is no use here: the lock must be usable before the process has finished
//! starting up, and a thread that tries to take it twice must be told so instead of hanging.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

/// Futex-backed lock word.
struct RawMutex {
    state: AtomicI32,
}

impl RawMutex {
    const fn new() -> Self {
        RawMutex {
            state: AtomicI32::new(UNLOCKED),
        }
    }

    #[inline]
    fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicI32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    CONTENDED,
                    std::ptr::null::<libc::timespec>(),
                );
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicI32,
                    libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                    1i32,
                );
            }
        }
    }
}

/// Returned by [`ErrorCheckMutex::lock`] when the calling thread already holds the lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reentered;

impl fmt::Display for Reentered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("lock already held by the calling thread")
    }
}

impl std::error::Error for Reentered {}

/// A mutex that detects relocking from the owning thread.
pub struct ErrorCheckMutex {
    raw: RawMutex,
    // Kernel thread id of the holder, 0 when free.
    owner: AtomicI32,
}

impl ErrorCheckMutex {
    pub const fn new() -> Self {
        ErrorCheckMutex {
            raw: RawMutex::new(),
            owner: AtomicI32::new(0),
        }
    }

    /// Block until the lock is free, unless this thread is the one holding it.
    pub fn lock(&self) -> Result<ErrorCheckGuard<'_>, Reentered> {
        let me = current_tid();
        // Only this thread ever stores `me`, and it clears it before unlocking.
        if self.owner.load(Ordering::Relaxed) == me {
            return Err(Reentered);
        }
        self.raw.lock();
        self.owner.store(me, Ordering::Relaxed);
        Ok(ErrorCheckGuard { mutex: self })
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_tid()
    }
}

impl Default for ErrorCheckMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ErrorCheckGuard<'a> {
    mutex: &'a ErrorCheckMutex,
}

impl Drop for ErrorCheckGuard<'_> {
    fn drop(&mut self) {
        self.mutex.owner.store(0, Ordering::Relaxed);
        self.mutex.raw.unlock();
    }
}

// A raw syscall: the libc wrapper is not available on older glibc, and TLS caching would
// need lazily allocated storage on some loaders.
fn current_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}
