//! Process-shared mutex and condition variable
//!
//! Thin wrappers over `pthread_mutex_t` / `pthread_cond_t` initialized with
//! `PTHREAD_PROCESS_SHARED`. They are meant to be placed inside a
//! `SharedRegion` and initialized in place before any worker is forked;
//! `std::sync` primitives cannot be shared across processes.
//!
//! Lifecycle: `init` once (in place), use from any process, `destroy` once
//! after every process that might wait on it has exited.

use core::cell::UnsafeCell;
use std::time::Duration;

use txlaunch_core::error::SyncError;

/// A process-shared mutex
#[repr(C)]
pub struct SharedMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// Safety: pthread mutexes are designed for concurrent use once initialized
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialize a mutex in place
    ///
    /// # Safety
    /// `this` must point to writable memory that no thread or process is
    /// using as a mutex yet.
    pub unsafe fn init(this: *mut Self) -> Result<(), SyncError> {
        let mut attr = core::mem::MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(SyncError::AttrFailed(rc));
        }
        let rc = libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            return Err(SyncError::AttrFailed(rc));
        }
        let rc = libc::pthread_mutex_init(UnsafeCell::raw_get(core::ptr::addr_of!((*this).raw)), attr.as_ptr());
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        if rc != 0 {
            return Err(SyncError::MutexInitFailed(rc));
        }
        Ok(())
    }

    /// Block until the mutex is held
    #[inline]
    pub fn lock(&self) -> SharedMutexGuard<'_> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_lock failed");
        SharedMutexGuard { mutex: self }
    }

    /// Destroy the mutex
    ///
    /// # Safety
    /// No thread or process may hold or wait on the mutex, now or later.
    pub unsafe fn destroy(&self) -> Result<(), SyncError> {
        match libc::pthread_mutex_destroy(self.raw.get()) {
            0 => Ok(()),
            rc => Err(SyncError::DestroyFailed(rc)),
        }
    }
}

/// Holds a `SharedMutex`; unlocks on drop
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_unlock(self.mutex.raw.get()) };
    }
}

/// A process-shared condition variable
#[repr(C)]
pub struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Initialize a condition variable in place
    ///
    /// Timed waits use `CLOCK_MONOTONIC` where the platform allows it.
    ///
    /// # Safety
    /// Same as `SharedMutex::init`.
    pub unsafe fn init(this: *mut Self) -> Result<(), SyncError> {
        let mut attr = core::mem::MaybeUninit::<libc::pthread_condattr_t>::uninit();
        let rc = libc::pthread_condattr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(SyncError::AttrFailed(rc));
        }
        let mut rc = libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        if rc == 0 {
            rc = libc::pthread_condattr_setclock(attr.as_mut_ptr(), libc::CLOCK_MONOTONIC);
        }
        if rc != 0 {
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            return Err(SyncError::AttrFailed(rc));
        }
        let rc = libc::pthread_cond_init(UnsafeCell::raw_get(core::ptr::addr_of!((*this).raw)), attr.as_ptr());
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        if rc != 0 {
            return Err(SyncError::CondInitFailed(rc));
        }
        Ok(())
    }

    /// Atomically release the guard's mutex and wait for a signal
    ///
    /// May wake spuriously; callers re-check their predicate.
    #[inline]
    pub fn wait(&self, guard: &mut SharedMutexGuard<'_>) {
        let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), guard.mutex.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_cond_wait failed");
    }

    /// Like `wait`, but gives up after `timeout`
    ///
    /// Returns `false` if the wait timed out.
    pub fn wait_timeout(&self, guard: &mut SharedMutexGuard<'_>, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let rc = unsafe { libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw.get(), &deadline) };
        rc != libc::ETIMEDOUT
    }

    /// Wake one waiter
    #[inline]
    pub fn signal(&self) {
        unsafe { libc::pthread_cond_signal(self.raw.get()) };
    }

    /// # Safety
    /// No thread or process may wait on the condvar, now or later.
    pub unsafe fn destroy(&self) -> Result<(), SyncError> {
        match libc::pthread_cond_destroy(self.raw.get()) {
            0 => Ok(()),
            rc => Err(SyncError::DestroyFailed(rc)),
        }
    }
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
            let clock = libc::CLOCK_MONOTONIC;
        } else {
            let clock = libc::CLOCK_REALTIME;
        }
    }
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(clock, &mut now) };

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{RegionLayout, SharedRegion};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[repr(C)]
    struct Gate {
        lock: SharedMutex,
        cond: SharedCondvar,
        open: AtomicU32,
    }

    fn gate_region() -> (SharedRegion, *mut Gate) {
        let mut layout = RegionLayout::new();
        let off = layout.push::<Gate>(1);
        let region = SharedRegion::new(layout.size()).unwrap();
        let gate = unsafe { region.at::<Gate>(off) };
        unsafe {
            SharedMutex::init(core::ptr::addr_of_mut!((*gate).lock)).unwrap();
            SharedCondvar::init(core::ptr::addr_of_mut!((*gate).cond)).unwrap();
        }
        (region, gate)
    }

    #[test]
    fn test_wait_timeout_expires() {
        let (_region, gate) = gate_region();
        let gate = unsafe { &*gate };

        let start = Instant::now();
        let mut guard = gate.lock.lock();
        let woken = gate.cond.wait_timeout(&mut guard, Duration::from_millis(30));
        drop(guard);

        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(20));
        unsafe {
            gate.cond.destroy().unwrap();
            gate.lock.destroy().unwrap();
        }
    }

    #[test]
    fn test_signal_across_fork() {
        let (_region, gate) = gate_region();
        let gate = unsafe { &*gate };

        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                let guard = gate.lock.lock();
                gate.open.store(1, Ordering::Relaxed);
                gate.cond.signal();
                drop(guard);
                unsafe { libc::_exit(0) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                let mut guard = gate.lock.lock();
                let deadline = Instant::now() + Duration::from_secs(10);
                while gate.open.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
                    gate.cond.wait_timeout(&mut guard, Duration::from_millis(100));
                }
                drop(guard);
                nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(gate.open.load(Ordering::Relaxed), 1);
            }
        }

        unsafe {
            gate.cond.destroy().unwrap();
            gate.lock.destroy().unwrap();
        }
    }
}
