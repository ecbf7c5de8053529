//! # txlaunch-runtime
//!
//! Unix runtime for the txlaunch transaction execution layer.
//!
//! This crate provides:
//! - Anonymous shared memory regions (mmap, inherited across fork)
//! - Process-shared pthread mutex/condvar
//! - A completion counter workers in other processes can bump and wake
//! - The `Launcher` trait and three launchers: thread pool, process pool
//!   and process-per-request
//! - A record store that lives in shared memory
//! - Throughput sampling

pub mod config;
pub mod shm;
pub mod sync;
pub mod completion;
pub mod launcher;
pub mod thread_pool;
pub mod process_pool;
pub mod process_launcher;
pub mod perf_monitor;
pub mod store;

#[cfg(not(unix))]
compile_error!("txlaunch-runtime needs a Unix platform (fork, mmap, pthreads)");

// Re-exports
pub use completion::CompletionCounter;
pub use config::{LauncherConfig, LauncherKind};
pub use launcher::{build, Launcher, LauncherCore};
pub use perf_monitor::{PerfMonitor, ThroughputSummary};
pub use process_launcher::ProcessLauncher;
pub use process_pool::ProcessPoolLauncher;
pub use shm::{RegionLayout, SharedRegion};
pub use store::SharedStore;
pub use sync::{SharedCondvar, SharedMutex};
pub use thread_pool::ThreadPoolLauncher;
