//! Process-pool launcher
//!
//! Same hand-off protocol as the thread pool, but each worker is a forked
//! process. Everything both sides touch lives in one anonymous shared
//! mapping created before the first `fork`:
//!
//! ```text
//!  ┌──────────────┬─────────────────────────┬───────────────────────────┐
//!  │ PoolHeader   │ ProcSlot[0..P]          │ buffers[0..P]             │
//!  │ idle lock/cv │ lock, cv, state, next,  │ buf_size bytes each,      │
//!  │ free lock    │ len                     │ wire-encoded request      │
//!  │ counts       │                         │                           │
//!  └──────────────┴─────────────────────────┴───────────────────────────┘
//! ```
//!
//! The free list is linked through `ProcSlot::next` by `WorkerId` index,
//! never by address. A request is flattened into the chosen worker's buffer
//! with `wire::encode`; the worker decodes it in place.
//!
//! Worker processes never allocate, never log and leave through `_exit`:
//! the parent may be multi-threaded, and only async-signal-safe work is
//! sound in a child of such a process. A request that panics is the one
//! exception; it is counted, still completes, and the worker carries on.
//!
//! On Linux each worker asks for SIGKILL when the forking thread dies, so
//! a parent that exits without running `Drop` leaves no workers behind.
//!
//! # Teardown
//!
//! 1. drain, watching for workers that died (`waitpid(WNOHANG)`)
//! 2. stop each worker through the idle protocol (Idle -> Stopped)
//! 3. reap every worker
//! 4. destroy the shared mutexes and condvars
//! 5. unmap (on drop)
//!
//! If a worker died, the rest are killed and reaped, and step 4 is
//! skipped: a process killed inside `pthread_cond_wait` never drops its
//! reference to the condvar, so destroying it could block forever. The
//! primitives hold no kernel resources and go away with the mapping.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};

use txlaunch_core::constants::MAX_POOL_SIZE;
use txlaunch_core::{
    kdebug, kerror, kwarn, wire, Database, LaunchError, LaunchResult, Request, SlotState,
    WorkerError, WorkerId,
};

use crate::completion::CompletionCounter;
use crate::config::LauncherConfig;
use crate::launcher::{Launcher, LauncherCore};
use crate::shm::{RegionLayout, SharedRegion};
use crate::sync::{SharedCondvar, SharedMutex};

/// How often a blocked dispatcher or drain checks that workers are alive
const LIVENESS_PERIOD: Duration = Duration::from_millis(100);

/// Pool-wide shared state
///
/// Counts are atomics so they can be read without the lock for
/// introspection; they are only written with the matching lock held.
#[repr(C)]
struct PoolHeader {
    idle_lock: SharedMutex,
    idle_cond: SharedCondvar,
    free_lock: SharedMutex,
    nprocs_idle: AtomicU32,
    free_head: AtomicU32,
    free_len: AtomicU32,
    faults: AtomicU32,
    panics: AtomicU32,
}

/// Per-worker shared state
#[repr(C)]
struct ProcSlot {
    lock: SharedMutex,
    wake: SharedCondvar,
    state: AtomicU32,
    next: AtomicU32,
    len: AtomicU32,
}

/// Typed view of the pool mapping
///
/// Valid as long as the owning `SharedRegion`; a forked child inherits
/// the mapping at the same address, so the view is valid there too.
#[derive(Clone, Copy)]
struct PoolView {
    header: *const PoolHeader,
    slots: *const ProcSlot,
    bufs: *mut u8,
    buf_size: usize,
    pool_size: usize,
}

unsafe impl Send for PoolView {}
unsafe impl Sync for PoolView {}

impl PoolView {
    #[inline]
    fn header(&self) -> &PoolHeader {
        unsafe { &*self.header }
    }

    #[inline]
    fn slot(&self, id: WorkerId) -> &ProcSlot {
        debug_assert!(id.as_usize() < self.pool_size);
        unsafe { &*self.slots.add(id.as_usize()) }
    }

    /// Start of a worker's request buffer (8-aligned)
    #[inline]
    fn buffer(&self, id: WorkerId) -> *mut u8 {
        debug_assert!(id.as_usize() < self.pool_size);
        unsafe { self.bufs.add(id.as_usize() * self.buf_size) }
    }

    /// Pop the free-list head (idle count already decremented by caller)
    fn pop_free(&self) -> Option<WorkerId> {
        let hdr = self.header();
        let _g = hdr.free_lock.lock();
        let head = WorkerId::from(hdr.free_head.load(Ordering::Relaxed));
        if head.is_none() {
            return None;
        }
        let slot = self.slot(head);
        hdr.free_head.store(slot.next.load(Ordering::Relaxed), Ordering::Relaxed);
        slot.next.store(WorkerId::NONE.as_u32(), Ordering::Relaxed);
        hdr.free_len.fetch_sub(1, Ordering::Relaxed);
        Some(head)
    }

    /// Push a worker on the free list, then count it idle and signal
    fn push_free(&self, id: WorkerId) {
        let hdr = self.header();
        {
            let _g = hdr.free_lock.lock();
            self.slot(id).next.store(hdr.free_head.load(Ordering::Relaxed), Ordering::Relaxed);
            hdr.free_head.store(id.as_u32(), Ordering::Relaxed);
            hdr.free_len.fetch_add(1, Ordering::Relaxed);
        }
        let _g = hdr.idle_lock.lock();
        hdr.nprocs_idle.fetch_add(1, Ordering::Relaxed);
        hdr.idle_cond.signal();
    }
}

struct WorkerProc {
    pid: Pid,
    reaped: bool,
}

/// Launcher backed by a fixed pool of forked worker processes
pub struct ProcessPoolLauncher {
    core: LauncherCore,
    region: SharedRegion,
    view: PoolView,
    db: Arc<dyn Database>,
    workers: Mutex<Vec<WorkerProc>>,
    crashed: AtomicI32,
    stopped: bool,
}

#[inline]
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessPoolLauncher {
    /// Fork `pool_size` workers over `db` with default buffer sizing
    pub fn new(pool_size: usize, db: Arc<dyn Database>) -> LaunchResult<Self> {
        Self::with_config(&LauncherConfig::new().pool_size(pool_size), db)
    }

    pub fn with_config(config: &LauncherConfig, db: Arc<dyn Database>) -> LaunchResult<Self> {
        let n = config.pool_size;
        let buf_size = config.request_buf_size;
        if n == 0 || n > MAX_POOL_SIZE {
            return Err(LaunchError::InvalidConfig("pool_size must be in 1..=256"));
        }
        if buf_size < wire::encoded_len(1) || buf_size % 8 != 0 {
            return Err(LaunchError::InvalidConfig("request_buf_size too small or unaligned"));
        }
        if !db.is_process_shared() {
            return Err(LaunchError::NotProcessShared);
        }

        let core = LauncherCore::new(config.drain_spins)?;

        let mut layout = RegionLayout::new();
        let header_off = layout.push::<PoolHeader>(1);
        let slots_off = layout.push::<ProcSlot>(n);
        let bufs_off = layout.push_bytes(n * buf_size, 8);
        let region = SharedRegion::new(layout.size())?;

        let view = unsafe {
            PoolView {
                header: region.at::<PoolHeader>(header_off),
                slots: region.at::<ProcSlot>(slots_off),
                bufs: region.at::<u8>(bufs_off),
                buf_size,
                pool_size: n,
            }
        };
        unsafe { init_shared(&view)? };

        let mut pool = Self {
            core,
            region,
            view,
            db,
            workers: Mutex::new(Vec::with_capacity(n)),
            crashed: AtomicI32::new(0),
            stopped: false,
        };

        let parent = getpid();
        for i in 0..n {
            let id = WorkerId::new(i as u32);
            // Safety: the child only runs `child_main`, which touches the
            // shared mapping and the record store, then `_exit`s.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    if !bind_to_parent(parent) {
                        unsafe { libc::_exit(0) };
                    }
                    let code = child_main(view, id, &*pool.db, pool.core.counter());
                    unsafe { libc::_exit(code) };
                }
                Ok(ForkResult::Parent { child }) => {
                    lock(&pool.workers).push(WorkerProc { pid: child, reaped: false });
                }
                Err(e) => {
                    kerror!("fork of {} failed: {}", id, e);
                    pool.abort();
                    return Err(WorkerError::ForkFailed(e as i32).into());
                }
            }
        }

        kdebug!(
            "process pool started: {} workers, {} byte buffers, {} byte mapping",
            n,
            buf_size,
            pool.region.len()
        );
        Ok(pool)
    }

    /// Idle workers according to the count
    pub fn idle_count(&self) -> usize {
        self.view.header().nprocs_idle.load(Ordering::Relaxed) as usize
    }

    /// Idle workers according to the free list
    pub fn free_list_len(&self) -> usize {
        self.view.header().free_len.load(Ordering::Relaxed) as usize
    }

    /// Per-worker buffer capacity in bytes
    pub fn request_buf_size(&self) -> usize {
        self.view.buf_size
    }

    /// Request buffers that workers refused to decode
    pub fn faults(&self) -> u32 {
        self.view.header().faults.load(Ordering::Relaxed)
    }

    /// Requests whose execution panicked (still counted as completed)
    pub fn panics(&self) -> u32 {
        self.view.header().panics.load(Ordering::Relaxed)
    }

    /// Process ids of workers not yet reaped
    pub fn worker_pids(&self) -> Vec<i32> {
        lock(&self.workers)
            .iter()
            .filter(|w| !w.reaped)
            .map(|w| w.pid.as_raw())
            .collect()
    }

    fn crashed_pid(&self) -> Option<i32> {
        match self.crashed.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Reap any worker that exited on its own; error if one did
    fn check_workers(&self) -> LaunchResult<()> {
        if let Some(pid) = self.crashed_pid() {
            return Err(WorkerError::Crashed { pid }.into());
        }
        let mut workers = lock(&self.workers);
        for w in workers.iter_mut().filter(|w| !w.reaped) {
            match waitpid(w.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    w.reaped = true;
                    let pid = w.pid.as_raw();
                    kerror!("worker process {} exited unexpectedly: {:?}", pid, status);
                    self.crashed.store(pid, Ordering::Release);
                    return Err(WorkerError::Crashed { pid }.into());
                }
                Err(e) => return Err(WorkerError::ReapFailed(e as i32).into()),
            }
        }
        Ok(())
    }

    /// Reap worker `id` if it has exited; error if it has
    fn check_worker(&self, id: WorkerId) -> LaunchResult<()> {
        let mut workers = lock(&self.workers);
        let Some(w) = workers.get_mut(id.as_usize()) else {
            return Ok(());
        };
        if w.reaped {
            return Err(WorkerError::Crashed { pid: w.pid.as_raw() }.into());
        }
        match waitpid(w.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(()),
            Ok(status) => {
                w.reaped = true;
                let pid = w.pid.as_raw();
                kerror!("{} (pid {}) exited while idle: {:?}", id, pid, status);
                self.crashed.store(pid, Ordering::Release);
                Err(WorkerError::Crashed { pid }.into())
            }
            Err(e) => Err(WorkerError::ReapFailed(e as i32).into()),
        }
    }

    /// Take an idle worker off the free list, blocking until there is one
    fn acquire_worker(&self) -> LaunchResult<WorkerId> {
        let hdr = self.view.header();
        {
            let mut g = hdr.idle_lock.lock();
            while hdr.nprocs_idle.load(Ordering::Relaxed) == 0 {
                if !hdr.idle_cond.wait_timeout(&mut g, LIVENESS_PERIOD) {
                    self.check_workers()?;
                }
            }
            hdr.nprocs_idle.fetch_sub(1, Ordering::Relaxed);
        }
        loop {
            if let Some(id) = self.view.pop_free() {
                return Ok(id);
            }
            core::hint::spin_loop();
        }
    }

    /// Move an acquired worker out of `Idle` and wake it
    fn hand_off(&self, id: WorkerId, next: SlotState, len: usize) {
        let slot = self.view.slot(id);
        let _g = slot.lock.lock();
        debug_assert!(SlotState::from(slot.state.load(Ordering::Relaxed)).can_become(next));
        slot.len.store(len as u32, Ordering::Relaxed);
        slot.state.store(next.into(), Ordering::Relaxed);
        slot.wake.signal();
    }

    /// Drain, then stop every live worker through the idle protocol
    fn stop_workers(&self) -> LaunchResult<()> {
        self.check_workers()?;
        while !self.core.wait_outstanding_timeout(LIVENESS_PERIOD) {
            self.check_workers()?;
        }
        let live = lock(&self.workers).iter().filter(|w| !w.reaped).count();
        for _ in 0..live {
            let id = self.acquire_worker()?;
            self.hand_off(id, SlotState::Stopped, 0);
        }
        Ok(())
    }

    /// Wait for every unreaped worker; error if any did not exit cleanly
    fn reap_all(&self, killed: bool) -> LaunchResult<()> {
        let mut result = Ok(());
        for w in lock(&self.workers).iter_mut().filter(|w| !w.reaped) {
            match waitpid(w.pid, None) {
                Ok(WaitStatus::Exited(_, 0)) => {}
                Ok(WaitStatus::Signaled(_, Signal::SIGKILL, _)) if killed => {}
                Ok(status) => {
                    kerror!("worker process {} ended badly: {:?}", w.pid, status);
                    result = Err(WorkerError::Crashed { pid: w.pid.as_raw() }.into());
                }
                Err(e) => result = Err(WorkerError::ReapFailed(e as i32).into()),
            }
            w.reaped = true;
        }
        result
    }

    fn kill_all(&self) {
        for w in lock(&self.workers).iter().filter(|w| !w.reaped) {
            if let Err(e) = kill(w.pid, Signal::SIGKILL) {
                kwarn!("kill of worker {} failed: {}", w.pid, e);
            }
        }
    }

    /// Kill and reap everything without touching the shared primitives
    fn abort(&mut self) {
        self.stopped = true;
        self.kill_all();
        if let Err(e) = self.reap_all(true) {
            kwarn!("process pool abort: {}", e);
        }
    }

    unsafe fn destroy_shared(&self) {
        let hdr = self.view.header();
        let mut failures = 0;
        for i in 0..self.view.pool_size {
            let slot = self.view.slot(WorkerId::new(i as u32));
            failures += slot.wake.destroy().is_err() as u32;
            failures += slot.lock.destroy().is_err() as u32;
        }
        failures += hdr.idle_cond.destroy().is_err() as u32;
        failures += hdr.idle_lock.destroy().is_err() as u32;
        failures += hdr.free_lock.destroy().is_err() as u32;
        if failures > 0 {
            kwarn!("{} shared primitive(s) failed to destroy", failures);
        }
    }
}

impl Launcher for ProcessPoolLauncher {
    fn execute_request(&self, req: Request) -> LaunchResult<()> {
        if self.stopped {
            return Err(LaunchError::ShutDown);
        }
        if let Some(pid) = self.crashed_pid() {
            return Err(WorkerError::Crashed { pid }.into());
        }
        if !std::ptr::addr_eq(Arc::as_ptr(req.database()), Arc::as_ptr(&self.db)) {
            return Err(LaunchError::ForeignDatabase);
        }
        let size = req.copy_size();
        if size > self.view.buf_size {
            return Err(LaunchError::RequestTooLarge {
                size,
                capacity: self.view.buf_size,
            });
        }

        let id = self.acquire_worker()?;
        if let Err(e) = self.check_worker(id) {
            self.view.push_free(id);
            return Err(e);
        }
        // Safety: the worker is off the free list, so this thread owns its buffer
        let buf = unsafe { core::slice::from_raw_parts_mut(self.view.buffer(id), self.view.buf_size) };
        let written = match wire::encode(&req.as_txn(), buf) {
            Ok(n) => n,
            Err(e) => {
                self.view.push_free(id);
                return Err(e);
            }
        };

        self.core.record_issued();
        self.hand_off(id, SlotState::Assigned, written);
        Ok(())
    }

    fn read_txns_executed(&self) -> u64 {
        self.core.executed()
    }

    fn txns_issued(&self) -> u64 {
        self.core.issued()
    }

    fn wait_outstanding(&self) {
        while !self.core.wait_outstanding_timeout(LIVENESS_PERIOD) {
            if let Err(e) = self.check_workers() {
                kerror!(
                    "drain abandoned: {}, {} request(s) will not complete",
                    e,
                    self.core.outstanding()
                );
                return;
            }
        }
    }

    fn pool_size(&self) -> usize {
        self.view.pool_size
    }

    fn shutdown(&mut self) -> LaunchResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let result = match self.stop_workers() {
            Ok(()) => self.reap_all(false),
            Err(e) => {
                kerror!("process pool teardown: {}, killing workers", e);
                self.kill_all();
                let _ = self.reap_all(true);
                Err(e)
            }
        };

        match result {
            Ok(()) => {
                // Every worker left through the stop order; nobody waits
                unsafe { self.destroy_shared() };
                kdebug!("process pool stopped: {} executed", self.core.executed());
                match self.faults() {
                    0 => Ok(()),
                    n => Err(WorkerError::Faulted(n).into()),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "process-pool"
    }
}

impl Drop for ProcessPoolLauncher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            kerror!("process pool teardown: {}", e);
        }
    }
}

/// Initialize primitives, link every slot into the free list, all idle
///
/// # Safety
/// `view` must cover a freshly mapped region no other process uses yet.
unsafe fn init_shared(view: &PoolView) -> LaunchResult<()> {
    let hdr = view.header as *mut PoolHeader;
    SharedMutex::init(core::ptr::addr_of_mut!((*hdr).idle_lock))?;
    SharedCondvar::init(core::ptr::addr_of_mut!((*hdr).idle_cond))?;
    SharedMutex::init(core::ptr::addr_of_mut!((*hdr).free_lock))?;

    for i in 0..view.pool_size {
        let slot = (view.slots as *mut ProcSlot).add(i);
        SharedMutex::init(core::ptr::addr_of_mut!((*slot).lock))?;
        SharedCondvar::init(core::ptr::addr_of_mut!((*slot).wake))?;
        let next = if i + 1 < view.pool_size {
            WorkerId::new(i as u32 + 1)
        } else {
            WorkerId::NONE
        };
        let slot = &*slot;
        slot.state.store(SlotState::Idle.into(), Ordering::Relaxed);
        slot.next.store(next.as_u32(), Ordering::Relaxed);
        slot.len.store(0, Ordering::Relaxed);
    }

    let hdr = &*hdr;
    hdr.free_head.store(0, Ordering::Relaxed);
    hdr.free_len.store(view.pool_size as u32, Ordering::Relaxed);
    hdr.nprocs_idle.store(view.pool_size as u32, Ordering::Relaxed);
    hdr.faults.store(0, Ordering::Relaxed);
    hdr.panics.store(0, Ordering::Relaxed);
    Ok(())
}

/// Tie a freshly forked child to `parent`; `false` if it is already gone
///
/// On Linux the child gets SIGKILL when the thread that forked it exits.
/// Elsewhere only the immediate check is made.
pub(crate) fn bind_to_parent(parent: Pid) -> bool {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) };
        }
    }
    // The parent may have died before the death signal was armed
    unsafe { libc::getppid() == parent.as_raw() }
}

/// Worker process entry point; returns the exit code
fn child_main(view: PoolView, id: WorkerId, db: &dyn Database, counter: &CompletionCounter) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(|| worker_loop(view, id, db, counter))) {
        Ok(()) => 0,
        Err(_) => 101,
    }
}

fn worker_loop(view: PoolView, id: WorkerId, db: &dyn Database, counter: &CompletionCounter) {
    let slot = view.slot(id);
    loop {
        {
            let mut g = slot.lock.lock();
            loop {
                match SlotState::from(slot.state.load(Ordering::Relaxed)) {
                    SlotState::Assigned => break,
                    SlotState::Stopped => return,
                    SlotState::Idle | SlotState::Executing => slot.wake.wait(&mut g),
                }
            }
            slot.state.store(SlotState::Executing.into(), Ordering::Relaxed);
        }

        let len = (slot.len.load(Ordering::Relaxed) as usize).min(view.buf_size);
        // Safety: this worker owns its buffer until it is back on the free list
        let buf = unsafe { core::slice::from_raw_parts(view.buffer(id), len) };
        match wire::decode(buf) {
            Ok(txn) if txn.validate(db).is_ok() => {
                if panic::catch_unwind(AssertUnwindSafe(|| txn.execute(db))).is_err() {
                    view.header().panics.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                view.header().faults.fetch_add(1, Ordering::Relaxed);
            }
        }
        counter.complete();

        {
            let _g = slot.lock.lock();
            slot.state.store(SlotState::Idle.into(), Ordering::Relaxed);
        }
        view.push_free(id);
    }
}
