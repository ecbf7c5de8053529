//! # txlaunch-core
//!
//! Core types for the txlaunch transaction execution layer.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Shared memory, process-shared synchronization and the launchers
//! themselves live in `txlaunch-runtime`.
//!
//! ## Modules
//!
//! - `id` - Worker slot identifier type
//! - `state` - Worker slot state machine
//! - `record` - Fixed-layout record of numeric fields
//! - `database` - Record store contract consumed by requests
//! - `request` - Transaction request and its lock/apply/unlock protocol
//! - `wire` - Flat request encoding for per-worker buffers
//! - `spinlock` - Cross-process record lock word
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod record;
pub mod database;
pub mod request;
pub mod wire;
pub mod spinlock;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::WorkerId;
pub use state::SlotState;
pub use record::{Deltas, Record};
pub use database::Database;
pub use request::{Request, TxnRef};
pub use spinlock::RecordLock;
pub use error::{ErrorClass, LaunchError, LaunchResult, MemoryError, SyncError, WorkerError};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Constants for record and buffer layout
pub mod constants {
    /// Width of one numeric field in a record
    pub const FIELD_SIZE: usize = 8;

    /// Size of one record in bytes
    pub const RECORD_SIZE: usize = 64;

    /// Number of fields per record (and of update deltas per request)
    pub const FIELDS_PER_RECORD: usize = RECORD_SIZE / FIELD_SIZE;

    /// Per-worker request buffer capacity (1 KiB)
    pub const REQUEST_BUF_SIZE: usize = 1 << 10;

    /// Cache line size for alignment
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Maximum pool size accepted by the launchers
    pub const MAX_POOL_SIZE: usize = 256;

    const _: () = assert!(RECORD_SIZE % FIELD_SIZE == 0);
}
