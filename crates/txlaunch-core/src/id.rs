//! Worker slot identifier type

use core::fmt;

/// Index of a worker slot in a pool
///
/// Slots are addressed by index rather than by pointer so the same value
/// resolves in every process that maps the pool. The maximum value
/// (u32::MAX) is reserved as the "end of free list" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    /// Sentinel value indicating no worker
    pub const NONE: WorkerId = WorkerId(u32::MAX);

    /// Create a new WorkerId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        WorkerId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<WorkerId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u32> for WorkerId {
    #[inline]
    fn from(id: u32) -> Self {
        WorkerId(id)
    }
}

impl From<WorkerId> for u32 {
    #[inline]
    fn from(id: WorkerId) -> u32 {
        id.0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "WorkerId(NONE)")
        } else {
            write!(f, "WorkerId({})", self.0)
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "worker-none")
        } else {
            write!(f, "worker-{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_none() {
        assert!(WorkerId::NONE.is_none());
        assert_eq!(WorkerId::NONE.to_option(), None);
        assert_eq!(WorkerId::new(3).to_option(), Some(WorkerId::new(3)));
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(format!("{}", WorkerId::new(7)), "worker-7");
        assert_eq!(format!("{:?}", WorkerId::NONE), "WorkerId(NONE)");
    }
}
