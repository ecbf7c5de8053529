//! Library defaults for `LauncherConfig`

use txlaunch_core::constants::REQUEST_BUF_SIZE as CORE_REQUEST_BUF_SIZE;

/// Launcher kind name (`thread`, `process` or `fork`)
pub const LAUNCHER: &str = "thread";

/// Workers per pool
pub const POOL_SIZE: usize = 4;

/// Bytes per process-pool worker buffer
pub const REQUEST_BUF_SIZE: usize = CORE_REQUEST_BUF_SIZE;

/// Concurrent children of the process-per-request launcher
pub const MAX_OUTSTANDING: usize = 4;

/// Yielding spins before a drain sleeps
pub const DRAIN_SPINS: u32 = 128;

/// Throughput samples per run
pub const SAMPLES: usize = 60;

/// Spacing between samples
pub const SAMPLE_PERIOD_MS: u64 = 1000;

/// Records in the benchmark store
pub const NUM_RECORDS: u64 = 100_000;

/// Keys per benchmark transaction
pub const WRITES_PER_TXN: usize = 4;
