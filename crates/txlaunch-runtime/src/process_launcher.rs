//! Process-per-request launcher
//!
//! Forks a fresh child for every request, up to `max_outstanding` at a
//! time. The child runs the request against the shared store, bumps the
//! shared completion counter, gives back its concurrency slot and leaves
//! through `_exit`. The parent reaps finished children whenever it has to
//! wait for a slot, and all of them on drain.
//!
//! A child whose request panics still completes it and exits with
//! `PANIC_EXIT`; the parent counts it and keeps dispatching. Any other
//! abnormal exit marks the launcher crashed.
//!
//! The concurrency gate (`running` plus a process-shared mutex/condvar)
//! lives in its own anonymous mapping so children can release a slot.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};

use txlaunch_core::{
    kdebug, kerror, kwarn, LaunchError, LaunchResult, Request, WorkerError,
};

use crate::completion::CompletionCounter;
use crate::config::LauncherConfig;
use crate::launcher::{Launcher, LauncherCore};
use crate::process_pool::bind_to_parent;
use crate::shm::{RegionLayout, SharedRegion};
use crate::sync::{SharedCondvar, SharedMutex};

/// Re-check period while blocked on the gate or a drain
const REAP_PERIOD: Duration = Duration::from_millis(5);

/// Exit code of a child whose request panicked
const PANIC_EXIT: i32 = 101;

#[repr(C)]
struct ForkGate {
    lock: SharedMutex,
    cond: SharedCondvar,
    running: AtomicU32,
}

/// Launcher that forks one child per request
pub struct ProcessLauncher {
    core: LauncherCore,
    region: SharedRegion,
    children: Mutex<Vec<Pid>>,
    crashed: AtomicI32,
    panics: AtomicU64,
    max_outstanding: usize,
    stopped: bool,
}

#[inline]
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessLauncher {
    /// Allow at most `max_outstanding` live children
    pub fn new(max_outstanding: usize) -> LaunchResult<Self> {
        Self::with_config(&LauncherConfig::new().max_outstanding(max_outstanding))
    }

    pub fn with_config(config: &LauncherConfig) -> LaunchResult<Self> {
        let max = config.max_outstanding;
        if max == 0 || max > u32::MAX as usize {
            return Err(LaunchError::InvalidConfig("max_outstanding must be > 0"));
        }
        let core = LauncherCore::new(config.drain_spins)?;

        let mut layout = RegionLayout::new();
        let off = layout.push::<ForkGate>(1);
        let region = SharedRegion::new(layout.size())?;
        unsafe {
            let gate = region.at::<ForkGate>(off);
            SharedMutex::init(core::ptr::addr_of_mut!((*gate).lock))?;
            SharedCondvar::init(core::ptr::addr_of_mut!((*gate).cond))?;
            (*gate).running.store(0, Ordering::Relaxed);
        }

        kdebug!("fork launcher ready: max {} outstanding", max);
        Ok(Self {
            core,
            region,
            children: Mutex::new(Vec::with_capacity(max)),
            crashed: AtomicI32::new(0),
            panics: AtomicU64::new(0),
            max_outstanding: max,
            stopped: false,
        })
    }

    #[inline]
    fn gate(&self) -> &ForkGate {
        // Safety: initialized in `with_config`, lives as long as `region`
        unsafe { &*self.region.at::<ForkGate>(0) }
    }

    /// Children holding a concurrency slot
    pub fn running(&self) -> usize {
        self.gate().running.load(Ordering::Relaxed) as usize
    }

    /// Children not yet reaped (finished or not)
    pub fn unreaped(&self) -> usize {
        lock(&self.children).len()
    }

    /// Requests whose execution panicked (still counted as completed)
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    fn crashed_pid(&self) -> Option<i32> {
        match self.crashed.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn note_exit(&self, pid: Pid, status: WaitStatus) {
        match status {
            WaitStatus::Exited(_, 0) => {}
            WaitStatus::Exited(_, PANIC_EXIT) => {
                self.panics.fetch_add(1, Ordering::Relaxed);
                kwarn!("request child {}: request panicked", pid);
            }
            status => {
                kerror!("request child {} ended badly: {:?}", pid, status);
                let _ = self.crashed.compare_exchange(
                    0,
                    pid.as_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }

    /// Reap every child that has exited, without blocking
    pub fn reap_finished(&self) -> usize {
        let mut children = lock(&self.children);
        let before = children.len();
        children.retain(|&pid| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                self.note_exit(pid, status);
                false
            }
            Err(e) => {
                kwarn!("waitpid({}) failed: {}", pid, e);
                false
            }
        });
        before - children.len()
    }

    /// Block until every child has exited and been reaped
    fn reap_all(&self) -> LaunchResult<()> {
        let mut children = lock(&self.children);
        let mut result = Ok(());
        for pid in children.drain(..) {
            match waitpid(pid, None) {
                Ok(status) => self.note_exit(pid, status),
                Err(e) => result = Err(WorkerError::ReapFailed(e as i32).into()),
            }
        }
        result
    }

    /// Take a concurrency slot, reaping while the gate is full
    fn acquire_slot(&self) -> LaunchResult<()> {
        let gate = self.gate();
        let mut g = gate.lock.lock();
        while gate.running.load(Ordering::Relaxed) as usize >= self.max_outstanding {
            if !gate.cond.wait_timeout(&mut g, REAP_PERIOD) {
                self.reap_finished();
                if let Some(pid) = self.crashed_pid() {
                    return Err(WorkerError::Crashed { pid }.into());
                }
            }
        }
        gate.running.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release_slot(gate: &ForkGate) {
        let _g = gate.lock.lock();
        gate.running.fetch_sub(1, Ordering::Relaxed);
        gate.cond.signal();
    }

    fn drain(&self) {
        while !self.core.wait_outstanding_timeout(REAP_PERIOD) {
            self.reap_finished();
            if let Some(pid) = self.crashed_pid() {
                kerror!(
                    "drain abandoned: request child {} crashed, {} request(s) will not complete",
                    pid,
                    self.core.outstanding()
                );
                break;
            }
        }
    }
}

impl Launcher for ProcessLauncher {
    fn execute_request(&self, req: Request) -> LaunchResult<()> {
        if self.stopped {
            return Err(LaunchError::ShutDown);
        }
        if let Some(pid) = self.crashed_pid() {
            return Err(WorkerError::Crashed { pid }.into());
        }
        if !req.database().is_process_shared() {
            return Err(LaunchError::NotProcessShared);
        }

        self.acquire_slot()?;
        let parent = getpid();
        // Safety: the child only touches shared mappings, then `_exit`s
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                if !bind_to_parent(parent) {
                    unsafe { libc::_exit(0) };
                }
                let code = child_main(&req, self.core.counter(), self.gate());
                unsafe { libc::_exit(code) };
            }
            Ok(ForkResult::Parent { child }) => {
                lock(&self.children).push(child);
                self.core.record_issued();
                self.reap_finished();
                Ok(())
            }
            Err(e) => {
                kerror!("fork for request failed: {}", e);
                Self::release_slot(self.gate());
                Err(WorkerError::ForkFailed(e as i32).into())
            }
        }
    }

    fn read_txns_executed(&self) -> u64 {
        self.core.executed()
    }

    fn txns_issued(&self) -> u64 {
        self.core.issued()
    }

    fn wait_outstanding(&self) {
        self.drain();
        self.reap_finished();
    }

    fn pool_size(&self) -> usize {
        self.max_outstanding
    }

    fn shutdown(&mut self) -> LaunchResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.drain();
        self.reap_all()?;

        if let Some(pid) = self.crashed_pid() {
            return Err(WorkerError::Crashed { pid }.into());
        }
        // No child left to touch the gate
        let gate = self.gate();
        unsafe {
            if let Err(e) = gate.cond.destroy() {
                kwarn!("fork gate condvar: {}", e);
            }
            if let Err(e) = gate.lock.destroy() {
                kwarn!("fork gate mutex: {}", e);
            }
        }
        kdebug!("fork launcher stopped: {} executed", self.core.executed());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fork"
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            kerror!("fork launcher teardown: {}", e);
        }
    }
}

fn child_main(req: &Request, counter: &CompletionCounter, gate: &ForkGate) -> i32 {
    let code = match panic::catch_unwind(AssertUnwindSafe(|| req.execute())) {
        Ok(()) => 0,
        Err(_) => PANIC_EXIT,
    };
    counter.complete();
    ProcessLauncher::release_slot(gate);
    code
}
