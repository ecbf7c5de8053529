//! Launcher contract and the counters every launcher shares
//!
//! A launcher accepts requests, runs each exactly once on some worker and
//! counts completions. Dispatch returns once a worker owns the request;
//! `wait_outstanding` reconciles later.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use txlaunch_core::{Database, LaunchResult, Request};

use crate::completion::CompletionCounter;
use crate::config::{LauncherConfig, LauncherKind};
use crate::process_launcher::ProcessLauncher;
use crate::process_pool::ProcessPoolLauncher;
use crate::shm::SharedRegion;
use crate::thread_pool::ThreadPoolLauncher;

/// A dispatcher of requests onto workers
pub trait Launcher: Send + Sync {
    /// Hand `req` to a worker, blocking until one is idle
    ///
    /// On `Err` nothing was handed over and the counters are unchanged.
    fn execute_request(&self, req: Request) -> LaunchResult<()>;

    /// Requests completed so far (acquire)
    fn read_txns_executed(&self) -> u64;

    /// Requests successfully dispatched so far
    fn txns_issued(&self) -> u64;

    /// Block until every request dispatched before this call has completed
    ///
    /// No timeout: the pool must be making progress.
    fn wait_outstanding(&self);

    /// Number of workers (or the concurrency bound)
    fn pool_size(&self) -> usize;

    /// Drain, stop every worker and release shared resources
    ///
    /// Idempotent. Dispatch afterwards fails with `ShutDown`.
    fn shutdown(&mut self) -> LaunchResult<()>;

    /// Short name for reports
    fn name(&self) -> &'static str;
}

/// Issued/executed bookkeeping embedded in every launcher
///
/// The executed counter sits in its own shared mapping so worker processes
/// can bump it. `issued` is written only by dispatchers.
pub struct LauncherCore {
    region: SharedRegion,
    issued: AtomicU64,
    drain_spins: u32,
}

impl LauncherCore {
    pub fn new(drain_spins: u32) -> LaunchResult<Self> {
        let region = SharedRegion::new(core::mem::size_of::<CompletionCounter>())?;
        unsafe { region.at::<CompletionCounter>(0).write(CompletionCounter::new()) };
        Ok(Self {
            region,
            issued: AtomicU64::new(0),
            drain_spins,
        })
    }

    /// The shared completion counter
    #[inline]
    pub fn counter(&self) -> &CompletionCounter {
        // Safety: initialized in `new`, lives as long as `self.region`
        unsafe { &*self.region.at::<CompletionCounter>(0) }
    }

    /// Count one dispatched request
    ///
    /// Call only after a worker has been secured, so a rejected request
    /// never shows up as issued.
    #[inline]
    pub fn record_issued(&self) {
        self.issued.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    #[inline]
    pub fn executed(&self) -> u64 {
        self.counter().executed()
    }

    /// Wait until everything issued so far has completed
    pub fn wait_outstanding(&self) {
        let target = self.issued();
        self.counter().wait_until(target, self.drain_spins);
    }

    /// Like `wait_outstanding`; `false` if `timeout` elapsed first
    pub fn wait_outstanding_timeout(&self, timeout: Duration) -> bool {
        let target = self.issued();
        self.counter()
            .wait_until_timeout(target, self.drain_spins, timeout)
    }

    /// Requests issued but not yet completed
    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.issued().saturating_sub(self.executed())
    }
}

impl core::fmt::Debug for LauncherCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LauncherCore")
            .field("issued", &self.issued())
            .field("executed", &self.executed())
            .finish()
    }
}

/// Build the launcher `config` asks for, over `db`
pub fn build(config: &LauncherConfig, db: Arc<dyn Database>) -> LaunchResult<Box<dyn Launcher>> {
    config.validate()?;
    let launcher: Box<dyn Launcher> = match config.kind {
        LauncherKind::Thread => Box::new(ThreadPoolLauncher::with_config(config)?),
        LauncherKind::Process => Box::new(ProcessPoolLauncher::with_config(config, db)?),
        LauncherKind::Fork => Box::new(ProcessLauncher::with_config(config)?),
    };
    Ok(launcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SharedStore;
    use txlaunch_core::constants::FIELDS_PER_RECORD;

    #[test]
    fn test_core_counts() {
        let core = LauncherCore::new(16).unwrap();
        assert_eq!(core.issued(), 0);
        assert_eq!(core.executed(), 0);

        core.record_issued();
        core.record_issued();
        assert_eq!(core.outstanding(), 2);
        assert!(!core.wait_outstanding_timeout(Duration::from_millis(10)));

        core.counter().complete();
        core.counter().complete();
        core.wait_outstanding();
        assert_eq!(core.outstanding(), 0);
    }

    #[test]
    fn test_build_each_kind() {
        let store: Arc<dyn Database> = Arc::new(SharedStore::new(64).unwrap());
        for kind in [LauncherKind::Thread, LauncherKind::Process, LauncherKind::Fork] {
            let config = LauncherConfig::new().kind(kind).pool_size(2).max_outstanding(2);
            let mut launcher = build(&config, Arc::clone(&store)).unwrap();
            assert_eq!(launcher.pool_size(), 2);

            for key in 0..8u64 {
                let req = Request::new(Arc::clone(&store), vec![key], [1; FIELDS_PER_RECORD]).unwrap();
                launcher.execute_request(req).unwrap();
            }
            launcher.wait_outstanding();
            assert_eq!(launcher.read_txns_executed(), 8, "{}", launcher.name());
            launcher.shutdown().unwrap();
        }
        // Three launchers, one increment each
        let rec = store.get_record(3).unwrap();
        assert_eq!(rec.field(0), 3);
    }

    #[test]
    fn test_build_rejects_bad_config() {
        let store: Arc<dyn Database> = Arc::new(SharedStore::new(4).unwrap());
        let config = LauncherConfig::new().pool_size(0);
        assert!(build(&config, store).is_err());
    }
}
