//! Record store contract
//!
//! The store itself is external to the execution layer. Requests only
//! need three things from it: resolve a key to a record, and lock and
//! unlock a record by key.

use crate::record::Record;

/// A record store with per-record mutual exclusion
///
/// **Contract:**
/// - `lock_record(k)` blocks until the caller holds `k` exclusively;
///   `unlock_record(k)` releases it. Callers only pass keys for which
///   `get_record` returned `Some`.
/// - Locks are not reentrant. Requests never lock the same key twice.
/// - Records returned by `get_record` stay valid for the store's lifetime.
pub trait Database: Send + Sync {
    /// Resolve a key, or `None` if the store does not hold it
    fn get_record(&self, key: u64) -> Option<&Record>;

    /// Acquire the record's lock
    fn lock_record(&self, key: u64);

    /// Release the record's lock
    fn unlock_record(&self, key: u64);

    /// Number of records held
    fn num_records(&self) -> u64;

    /// Whether records and locks live in memory visible to forked children
    ///
    /// Process-based launchers refuse stores that return `false`: updates a
    /// child makes to a private copy would be lost.
    fn is_process_shared(&self) -> bool {
        false
    }
}
