//! Record store in shared memory
//!
//! Keys are `0..num_records`. Each key owns a 128-byte slot: a spin lock
//! word on the first cache line, the 64-byte record on the second, so
//! lock traffic does not bounce the record's line. The slots live in a
//! `SharedRegion`, which makes the store usable by forked workers.

use txlaunch_core::{Database, Deltas, LaunchResult, Record, RecordLock};

use crate::shm::{RegionLayout, SharedRegion};

#[repr(C, align(64))]
struct LockLine {
    lock: RecordLock,
}

#[repr(C)]
struct Slot {
    lock: LockLine,
    record: Record,
}

const _: () = assert!(core::mem::size_of::<Slot>() == 128);

/// Fixed-size store of zeroed records, shareable across `fork`
pub struct SharedStore {
    region: SharedRegion,
    num_records: u64,
}

impl SharedStore {
    /// Map and initialize `num_records` records, all fields zero
    pub fn new(num_records: u64) -> LaunchResult<Self> {
        let mut layout = RegionLayout::new();
        let off = layout.push::<Slot>(num_records as usize);
        debug_assert_eq!(off, 0);
        let region = SharedRegion::new(layout.size())?;

        let base = unsafe { region.at::<Slot>(0) };
        for i in 0..num_records as usize {
            unsafe {
                base.add(i).write(Slot {
                    lock: LockLine { lock: RecordLock::new() },
                    record: Record::new(),
                });
            }
        }

        Ok(Self { region, num_records })
    }

    #[inline]
    fn slot(&self, key: u64) -> Option<&Slot> {
        if key < self.num_records {
            // Safety: in bounds, initialized in `new`
            Some(unsafe { &*self.region.at::<Slot>(0).add(key as usize) })
        } else {
            None
        }
    }

    /// Copy of one record's fields (unlocked read)
    pub fn snapshot(&self, key: u64) -> Option<Deltas> {
        self.slot(key).map(|s| s.record.fields())
    }

    /// Sum of one field over every record
    ///
    /// Used to check that each update landed exactly once.
    pub fn field_sum(&self, field: usize) -> u64 {
        (0..self.num_records)
            .filter_map(|k| self.slot(k))
            .fold(0u64, |acc, s| acc.wrapping_add(s.record.field(field)))
    }
}

impl Database for SharedStore {
    #[inline]
    fn get_record(&self, key: u64) -> Option<&Record> {
        self.slot(key).map(|s| &s.record)
    }

    #[inline]
    fn lock_record(&self, key: u64) {
        if let Some(s) = self.slot(key) {
            s.lock.lock.lock();
        }
    }

    #[inline]
    fn unlock_record(&self, key: u64) {
        if let Some(s) = self.slot(key) {
            s.lock.lock.unlock();
        }
    }

    #[inline]
    fn num_records(&self) -> u64 {
        self.num_records
    }

    fn is_process_shared(&self) -> bool {
        true
    }
}

impl core::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedStore")
            .field("num_records", &self.num_records)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use txlaunch_core::constants::FIELDS_PER_RECORD;
    use txlaunch_core::Request;

    #[test]
    fn test_store_bounds() {
        let store = SharedStore::new(10).unwrap();
        assert_eq!(store.num_records(), 10);
        assert!(store.get_record(9).is_some());
        assert!(store.get_record(10).is_none());
        assert_eq!(store.snapshot(0), Some([0; FIELDS_PER_RECORD]));
        assert!(store.is_process_shared());
    }

    #[test]
    fn test_lock_unlock() {
        let store = SharedStore::new(4).unwrap();
        store.lock_record(2);
        assert!(store.slot(2).unwrap().lock.lock.is_locked());
        assert!(!store.slot(1).unwrap().lock.lock.is_locked());
        store.unlock_record(2);
        assert!(!store.slot(2).unwrap().lock.lock.is_locked());
    }

    #[test]
    fn test_request_against_store() {
        let store = Arc::new(SharedStore::new(16).unwrap());
        let req = Request::new(store.clone(), vec![4, 2], [3; FIELDS_PER_RECORD]).unwrap();
        req.execute();
        req.execute();
        assert_eq!(store.snapshot(2), Some([6; FIELDS_PER_RECORD]));
        assert_eq!(store.field_sum(0), 12);
    }

    #[test]
    fn test_updates_from_child_visible() {
        let store = Arc::new(SharedStore::new(8).unwrap());
        let req = Request::new(store.clone(), vec![5], [1; FIELDS_PER_RECORD]).unwrap();

        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                req.execute();
                unsafe { libc::_exit(0) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(store.snapshot(5), Some([1; FIELDS_PER_RECORD]));
            }
        }
    }
}
