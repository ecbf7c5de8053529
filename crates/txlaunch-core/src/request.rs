//! Transaction requests
//!
//! A request is a write-set of record keys plus one delta per record
//! field. Executing it locks every record in the write-set, adds the
//! deltas to each record, then unlocks.
//!
//! # Lock ordering
//!
//! The write-set is sorted ascending when the request is built and locks
//! are always taken in that order. Two requests with overlapping
//! write-sets therefore contend for shared keys in the same global order,
//! so no cycle of waiters can form. Duplicate keys are rejected up front:
//! record locks are not reentrant and a second acquire would self-deadlock.

use std::sync::Arc;

use crate::database::Database;
use crate::error::{LaunchError, LaunchResult};
use crate::record::Deltas;
use crate::wire;

/// An immutable transaction over one record store
pub struct Request {
    db: Arc<dyn Database>,
    write_set: Box<[u64]>,
    updates: Deltas,
}

impl Request {
    /// Build a request, sorting and validating the write-set
    ///
    /// Fails with `DuplicateKey` if a key repeats and with `UnknownKey` if
    /// the store does not hold a key. Nothing is locked on failure.
    pub fn new(
        db: Arc<dyn Database>,
        write_set: impl Into<Vec<u64>>,
        updates: Deltas,
    ) -> LaunchResult<Self> {
        let mut write_set = write_set.into();
        write_set.sort_unstable();

        if let Some(pair) = write_set.windows(2).find(|w| w[0] == w[1]) {
            return Err(LaunchError::DuplicateKey(pair[0]));
        }
        if let Some(&key) = write_set.iter().find(|&&k| db.get_record(k).is_none()) {
            return Err(LaunchError::UnknownKey(key));
        }

        Ok(Self {
            db,
            write_set: write_set.into_boxed_slice(),
            updates,
        })
    }

    /// Number of records written
    #[inline]
    pub fn num_writes(&self) -> usize {
        self.write_set.len()
    }

    /// Write-set in lock order (strictly ascending)
    #[inline]
    pub fn write_set(&self) -> &[u64] {
        &self.write_set
    }

    /// Per-field deltas
    #[inline]
    pub fn updates(&self) -> &Deltas {
        &self.updates
    }

    /// The store this request writes to
    #[inline]
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Bytes needed to flatten this request into a worker buffer
    #[inline]
    pub fn copy_size(&self) -> usize {
        wire::encoded_len(self.write_set.len())
    }

    /// Borrowed view of the transaction body
    #[inline]
    pub fn as_txn(&self) -> TxnRef<'_> {
        TxnRef {
            write_set: &self.write_set,
            updates: &self.updates,
        }
    }

    /// Lock, apply, unlock against this request's own store
    pub fn execute(&self) {
        self.as_txn().execute(&*self.db);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("write_set", &self.write_set)
            .field("updates", &self.updates)
            .finish()
    }
}

/// Transaction body borrowed from a `Request` or from a worker buffer
#[derive(Debug, Clone, Copy)]
pub struct TxnRef<'a> {
    write_set: &'a [u64],
    updates: &'a Deltas,
}

impl<'a> TxnRef<'a> {
    /// Wrap raw slices
    ///
    /// Does not validate. Use `validate` before executing slices that did
    /// not come from a `Request`.
    #[inline]
    pub fn new(write_set: &'a [u64], updates: &'a Deltas) -> Self {
        Self { write_set, updates }
    }

    #[inline]
    pub fn write_set(&self) -> &'a [u64] {
        self.write_set
    }

    #[inline]
    pub fn updates(&self) -> &'a Deltas {
        self.updates
    }

    /// Check lock order and key existence against `db`
    pub fn validate(&self, db: &dyn Database) -> LaunchResult<()> {
        for w in self.write_set.windows(2) {
            if w[0] == w[1] {
                return Err(LaunchError::DuplicateKey(w[0]));
            }
            if w[0] > w[1] {
                return Err(LaunchError::CorruptRequest("write-set not sorted"));
            }
        }
        match self.write_set.iter().find(|&&k| db.get_record(k).is_none()) {
            Some(&key) => Err(LaunchError::UnknownKey(key)),
            None => Ok(()),
        }
    }

    /// Lock every record in order, apply the deltas, unlock
    pub fn execute(&self, db: &dyn Database) {
        let locked = LockedRecords::acquire(db, self.write_set);
        for &key in self.write_set {
            match db.get_record(key) {
                Some(rec) => rec.apply(self.updates),
                None => debug_assert!(false, "key {} vanished after validation", key),
            }
        }
        drop(locked);
    }
}

/// Records locked by one transaction, released on drop
struct LockedRecords<'a> {
    db: &'a dyn Database,
    keys: &'a [u64],
    held: usize,
}

impl<'a> LockedRecords<'a> {
    fn acquire(db: &'a dyn Database, keys: &'a [u64]) -> Self {
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]), "write-set not in lock order");
        let mut locked = Self { db, keys, held: 0 };
        for &key in keys {
            db.lock_record(key);
            locked.held += 1;
        }
        locked
    }
}

impl Drop for LockedRecords<'_> {
    fn drop(&mut self) {
        // Release order does not matter once every update is applied
        for &key in &self.keys[..self.held] {
            self.db.unlock_record(key);
        }
    }
}
