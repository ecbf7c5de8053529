//! Fixed-layout record of numeric fields

use crate::constants::{FIELDS_PER_RECORD, FIELD_SIZE, RECORD_SIZE};
use core::sync::atomic::{AtomicU64, Ordering};

/// One update delta per record field
pub type Deltas = [u64; FIELDS_PER_RECORD];

/// A record: `RECORD_SIZE` bytes viewed as `FIELDS_PER_RECORD` u64 fields
///
/// Fields are atomics so a record may live in memory shared by several
/// processes, but they are only ever mutated while the store's record
/// lock is held. Readers outside the lock see each field untorn, not a
/// consistent row.
#[repr(C, align(64))]
pub struct Record {
    fields: [AtomicU64; FIELDS_PER_RECORD],
}

const _: () = assert!(core::mem::size_of::<Record>() == RECORD_SIZE);
const _: () = assert!(core::mem::size_of::<AtomicU64>() == FIELD_SIZE);

impl Record {
    /// Create a zeroed record
    pub const fn new() -> Self {
        Self {
            fields: [const { AtomicU64::new(0) }; FIELDS_PER_RECORD],
        }
    }

    /// Read one field
    #[inline]
    pub fn field(&self, idx: usize) -> u64 {
        self.fields[idx].load(Ordering::Relaxed)
    }

    /// Copy out every field
    pub fn fields(&self) -> Deltas {
        let mut out = [0u64; FIELDS_PER_RECORD];
        for (dst, src) in out.iter_mut().zip(self.fields.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
        out
    }

    /// Add `deltas[i]` to field `i` for every field (wrapping)
    ///
    /// Caller must hold this record's lock. The add is a plain load and
    /// store, not a fetch_add: the lock is what makes it race-free.
    #[inline]
    pub fn apply(&self, deltas: &Deltas) {
        for (field, delta) in self.fields.iter().zip(deltas.iter()) {
            let cur = field.load(Ordering::Relaxed);
            field.store(cur.wrapping_add(*delta), Ordering::Relaxed);
        }
    }

    /// Overwrite every field
    ///
    /// Caller must hold this record's lock.
    pub fn store(&self, values: &Deltas) {
        for (field, v) in self.fields.iter().zip(values.iter()) {
            field.store(*v, Ordering::Relaxed);
        }
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Record {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Record").field("fields", &self.fields()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_apply() {
        let rec = Record::new();
        let mut deltas = [0u64; FIELDS_PER_RECORD];
        for (i, d) in deltas.iter_mut().enumerate() {
            *d = i as u64 + 1;
        }
        rec.apply(&deltas);
        rec.apply(&deltas);
        for i in 0..FIELDS_PER_RECORD {
            assert_eq!(rec.field(i), 2 * (i as u64 + 1));
        }
    }

    #[test]
    fn test_record_apply_wraps() {
        let rec = Record::new();
        rec.store(&[u64::MAX; FIELDS_PER_RECORD]);
        rec.apply(&[2; FIELDS_PER_RECORD]);
        assert_eq!(rec.fields(), [1; FIELDS_PER_RECORD]);
    }

    #[test]
    fn test_record_layout() {
        assert_eq!(core::mem::size_of::<Record>(), RECORD_SIZE);
        assert_eq!(core::mem::align_of::<Record>(), 64);
    }
}
