//! Portable wait/wake for platforms without a shared futex
//!
//! There is no portable primitive that sleeps on an arbitrary word in
//! shared memory, so waiters nap briefly and re-check. Wakes are no-ops.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Upper bound on one nap
const NAP: Duration = Duration::from_micros(200);

pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    if word.load(Ordering::Acquire) == expected {
        std::thread::sleep(timeout.min(NAP));
    }
}

#[inline]
pub fn wake_all(_word: &AtomicU32) {}
