//! # txlaunch - transaction launchers
//!
//! Runs fixed-shape write transactions against a record store on a pool of
//! workers and counts how many completed.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use txlaunch::{build, Database, LauncherConfig, LauncherKind, Request, SharedStore};
//!
//! fn main() -> txlaunch::LaunchResult<()> {
//!     let db: Arc<dyn Database> = Arc::new(SharedStore::new(1000)?);
//!     let config = LauncherConfig::new().kind(LauncherKind::Process).pool_size(4);
//!     let mut launcher = build(&config, db.clone())?;
//!
//!     // Add 1 to every field of records 3, 17 and 42
//!     launcher.execute_request(Request::new(db.clone(), vec![42, 3, 17], [1; 8])?)?;
//!     launcher.wait_outstanding();
//!     assert_eq!(launcher.read_txns_executed(), 1);
//!
//!     launcher.shutdown()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Dispatcher(s)                          │
//! │        Request::new -> execute_request -> wait_outstanding  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Launcher + LauncherCore                  │
//! │      idle count, free list, issued / executed counters      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Forked   │
//!    │  Thread   │      │  Process  │      │  Child    │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                  Record store                           │
//!    │   lock write-set ascending, add deltas, unlock          │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use txlaunch_core::{
    constants,
    wire,
    Database,
    Deltas,
    ErrorClass,
    LaunchError,
    LaunchResult,
    MemoryError,
    Record,
    RecordLock,
    Request,
    SlotState,
    SyncError,
    TxnRef,
    WorkerError,
    WorkerId,
};

// Re-export kprint macros for debug logging
pub use txlaunch_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use txlaunch_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled, set_pid_enabled};

// Re-export env utilities
pub use txlaunch_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use txlaunch_runtime::{
    build,
    CompletionCounter,
    Launcher,
    LauncherConfig,
    LauncherKind,
    PerfMonitor,
    ProcessLauncher,
    ProcessPoolLauncher,
    SharedStore,
    ThreadPoolLauncher,
    ThroughputSummary,
};

/// Build the launcher described by the environment (`TXL_*`)
pub fn launcher_from_env(db: std::sync::Arc<dyn Database>) -> LaunchResult<Box<dyn Launcher>> {
    build(&LauncherConfig::from_env(), db)
}
