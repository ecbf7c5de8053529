//! Completion counter shared by a launcher and its workers
//!
//! Workers call `complete()` once per finished request. The dispatcher
//! drains with `wait_until(issued, spins)`: it spins with a yield hint for
//! a bounded number of rounds, then sleeps on a sequence word that every
//! completion bumps. On Linux the sleep is a shared futex, so it works
//! when the completer is a different process.
//!
//! Lost-wakeup freedom: a completer bumps `executed` and `seq`, then wakes
//! if `waiters > 0`. A waiter snapshots `seq`, registers in `waiters`, and
//! re-checks `executed` before sleeping on the snapshot. All four steps are
//! `SeqCst`, so either the waiter sees the new count or the completer sees
//! the waiter; a stale snapshot makes the futex return at once. The
//! bounded sleep is a backstop, not the wake path.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        use futex_linux as waiter;
    } else {
        mod fallback;
        use fallback as waiter;
    }
}

/// Longest single sleep between re-checks
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Monotonic count of completed requests, with a wakeable drain
///
/// Lives in shared memory; all-zero bytes are a valid initial state.
#[repr(C, align(64))]
pub struct CompletionCounter {
    executed: AtomicU64,
    seq: AtomicU32,
    waiters: AtomicU32,
}

impl CompletionCounter {
    pub const fn new() -> Self {
        Self {
            executed: AtomicU64::new(0),
            seq: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
        }
    }

    /// Completed requests so far (acquire)
    #[inline]
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }

    /// Record one completion and wake drainers
    #[inline]
    pub fn complete(&self) {
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.seq.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            waiter::wake_all(&self.seq);
        }
    }

    /// Block until at least `target` requests have completed
    pub fn wait_until(&self, target: u64, spins: u32) {
        self.wait_inner(target, spins, None);
    }

    /// Like `wait_until`, but give up after `timeout`
    ///
    /// Returns `false` on timeout.
    pub fn wait_until_timeout(&self, target: u64, spins: u32, timeout: Duration) -> bool {
        self.wait_inner(target, spins, Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, target: u64, spins: u32, deadline: Option<Instant>) -> bool {
        for _ in 0..spins {
            if self.executed() >= target {
                return true;
            }
            std::thread::yield_now();
        }

        loop {
            let seq = self.seq.load(Ordering::SeqCst);
            if self.executed.load(Ordering::SeqCst) >= target {
                return true;
            }

            let nap = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    (d - now).min(PARK_TIMEOUT)
                }
                None => PARK_TIMEOUT,
            };

            self.waiters.fetch_add(1, Ordering::SeqCst);
            if self.executed.load(Ordering::SeqCst) < target {
                waiter::wait(&self.seq, seq, nap);
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CompletionCounter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompletionCounter")
            .field("executed", &self.executed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SharedRegion;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_returns_immediately_when_reached() {
        let c = CompletionCounter::new();
        c.complete();
        c.complete();
        c.wait_until(2, 0);
        c.wait_until(0, 0);
        assert_eq!(c.executed(), 2);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let c = CompletionCounter::new();
        let start = Instant::now();
        assert!(!c.wait_until_timeout(1, 4, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_woken_by_threads() {
        let c = Arc::new(CompletionCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || {
                    for _ in 0..250 {
                        c.complete();
                    }
                })
            })
            .collect();

        assert!(c.wait_until_timeout(1000, 0, Duration::from_secs(10)));
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.executed(), 1000);
    }

    #[test]
    fn test_wait_woken_across_fork() {
        let region = SharedRegion::new(core::mem::size_of::<CompletionCounter>()).unwrap();
        let c = unsafe { &*region.at::<CompletionCounter>(0) };

        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                std::thread::sleep(Duration::from_millis(20));
                for _ in 0..3 {
                    c.complete();
                }
                unsafe { libc::_exit(0) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                assert!(c.wait_until_timeout(3, 0, Duration::from_secs(10)));
                nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(c.executed(), 3);
            }
        }
    }
}
