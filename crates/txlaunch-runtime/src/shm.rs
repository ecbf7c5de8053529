//! Anonymous shared memory regions
//!
//! A `SharedRegion` is a `MAP_SHARED | MAP_ANONYMOUS` mapping. Created
//! before `fork`, it is mapped at the same address in the parent and every
//! child, and writes from any of them are visible to all. The mapping is
//! zero-filled by the kernel and released with `munmap` on drop; once every
//! process holding it has unmapped or exited the kernel reclaims it, so
//! nothing outlives the pool (unlike named SysV or POSIX segments).

use core::ptr::NonNull;

use txlaunch_core::constants::CACHE_LINE_SIZE;
use txlaunch_core::error::{LaunchResult, MemoryError};
use txlaunch_core::kerror;

/// An owned anonymous shared mapping
pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the region is plain memory; all typed access goes through
// atomics or process-shared primitives placed in it by the owner.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map `len` bytes (rounded up to whole pages), zero-filled
    pub fn new(len: usize) -> LaunchResult<Self> {
        if len == 0 {
            return Err(MemoryError::InvalidSize.into());
        }
        let page = page_size();
        let len = len
            .checked_add(page - 1)
            .map(|l| l & !(page - 1))
            .ok_or(MemoryError::InvalidSize)?;

        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed(last_errno()).into());
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(MemoryError::MapFailed(0))?;

        Ok(Self { base, len })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Mapped length in bytes (page-rounded)
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Typed pointer at `offset`
    ///
    /// # Safety
    /// `offset..offset + size_of::<T>()` must lie inside the region and be
    /// suitably aligned for `T`.
    #[inline]
    pub unsafe fn at<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset + core::mem::size_of::<T>() <= self.len);
        debug_assert!(offset % core::mem::align_of::<T>() == 0);
        self.base.as_ptr().add(offset) as *mut T
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            kerror!("munmap of {} bytes failed: {}", self.len, MemoryError::UnmapFailed(last_errno()));
        }
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

/// Offset allocator for carving several arrays out of one region
///
/// ```ignore
/// let mut layout = RegionLayout::new();
/// let header = layout.push::<Header>(1);
/// let slots = layout.push::<Slot>(n);
/// let region = SharedRegion::new(layout.size())?;
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct RegionLayout {
    size: usize,
}

impl RegionLayout {
    pub const fn new() -> Self {
        Self { size: 0 }
    }

    /// Reserve `count` values of `T`, returning their offset
    pub fn push<T>(&mut self, count: usize) -> usize {
        self.push_bytes(count * core::mem::size_of::<T>(), core::mem::align_of::<T>())
    }

    /// Reserve `len` raw bytes at cache-line alignment (or `align` if larger)
    pub fn push_bytes(&mut self, len: usize, align: usize) -> usize {
        let align = align.max(CACHE_LINE_SIZE);
        let off = (self.size + align - 1) & !(align - 1);
        self.size = off + len;
        off
    }

    /// Total bytes reserved so far
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

#[inline]
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_region_zeroed_and_page_rounded() {
        let region = SharedRegion::new(100).unwrap();
        assert!(region.len() >= 100);
        assert_eq!(region.len() % page_size(), 0);
        let bytes = unsafe { core::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_region_rejects_zero() {
        assert!(SharedRegion::new(0).is_err());
    }

    #[test]
    fn test_region_visible_across_fork() {
        let region = SharedRegion::new(64).unwrap();
        let cell = unsafe { &*region.at::<AtomicU64>(0) };

        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                cell.store(0xfeed, Ordering::Release);
                unsafe { libc::_exit(0) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(cell.load(Ordering::Acquire), 0xfeed);
            }
        }
    }

    #[test]
    fn test_layout_alignment() {
        let mut layout = RegionLayout::new();
        let a = layout.push::<u32>(3);
        let b = layout.push::<u64>(2);
        let c = layout.push_bytes(1000, 8);
        assert_eq!(a, 0);
        assert_eq!(b % CACHE_LINE_SIZE, 0);
        assert!(b >= 12);
        assert_eq!(c % CACHE_LINE_SIZE, 0);
        assert_eq!(layout.size(), c + 1000);
    }
}
