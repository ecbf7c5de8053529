//! Cross-process record lock
//!
//! A bare lock word with no protected data of its own: it guards a record
//! that sits next to it. Because it is a single `AtomicU32` with `repr(C)`,
//! it works unchanged in an anonymous shared mapping inherited across
//! `fork`, where a `std::sync::Mutex` would not.

use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Spins before yielding the CPU while contended
const SPINS_BEFORE_YIELD: u32 = 64;

/// A spin lock word
///
/// Record critical sections are a handful of field adds, so spinning
/// with backoff is cheaper than parking. After a short spin the waiter
/// yields the OS thread, which matters when more workers than CPUs
/// contend on one hot record.
#[repr(C)]
pub struct RecordLock {
    state: AtomicU32,
}

impl RecordLock {
    /// Create an unlocked lock
    #[inline]
    pub const fn new() -> Self {
        RecordLock {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquire the lock, spinning until it's available
    #[inline]
    pub fn lock(&self) {
        loop {
            // Try to acquire with weak CAS (can spuriously fail, but faster)
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            // Spin with backoff on a plain load
            let mut spin_count = 0u32;
            while self.state.load(Ordering::Relaxed) != UNLOCKED {
                spin_count = spin_count.wrapping_add(1);
                if spin_count > SPINS_BEFORE_YIELD {
                    std::thread::yield_now();
                } else {
                    for _ in 0..spin_count {
                        core::hint::spin_loop();
                    }
                }
            }
        }
    }

    /// Try to acquire the lock without spinning
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock
    ///
    /// Must only be called by the current holder.
    #[inline]
    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of an unlocked RecordLock");
        self.state.store(UNLOCKED, Ordering::Release);
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }
}

impl Default for RecordLock {
    fn default() -> Self {
        RecordLock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_unlock() {
        let lock = RecordLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock() {
        let lock = RecordLock::new();

        assert!(lock.try_lock());

        // While held, try_lock should fail
        assert!(!lock.try_lock());

        lock.unlock();

        // Now should succeed
        assert!(lock.try_lock());
        lock.unlock();
    }

    struct Guarded {
        lock: RecordLock,
        value: UnsafeCell<u64>,
    }

    unsafe impl Sync for Guarded {}

    #[test]
    fn test_lock_concurrent() {
        let g = Arc::new(Guarded {
            lock: RecordLock::new(),
            value: UnsafeCell::new(0),
        });
        let mut handles = vec![];

        for _ in 0..4 {
            let g = Arc::clone(&g);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    g.lock.lock();
                    unsafe { *g.value.get() += 1 };
                    g.lock.unlock();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        g.lock.lock();
        assert_eq!(unsafe { *g.value.get() }, 4000);
        g.lock.unlock();
    }
}
