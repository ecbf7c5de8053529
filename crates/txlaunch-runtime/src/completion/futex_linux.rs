//! Linux futex wait/wake on a shared word
//!
//! The word lives in a `MAP_SHARED` region, so the futex is used *without*
//! `FUTEX_PRIVATE_FLAG`: the kernel keys it by physical page and a wake
//! from a worker process reaches a waiter in the parent.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Sleep while `*word == expected`, for at most `timeout`
///
/// Returns on wake, timeout, signal, or if the word already changed.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as _,
    };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            core::ptr::null::<u32>(),
            0u32,
        );
    }
    // ETIMEDOUT, EAGAIN and EINTR all mean "re-check"; so does success
}

/// Wake every waiter sleeping on `word`
pub fn wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            core::ptr::null::<libc::timespec>(),
            core::ptr::null::<u32>(),
            0u32,
        );
    }
}
