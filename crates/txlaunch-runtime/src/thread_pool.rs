//! Thread-pool launcher
//!
//! A fixed set of worker threads, each with a private slot (mutex, condvar,
//! state, assigned request). Idle workers sit in a bounded lock-free queue;
//! a separate idle count under a mutex/condvar lets a dispatcher block
//! until one is available.
//!
//! ```text
//!  dispatcher                            worker i
//!  ──────────                            ────────
//!  idle.lock; wait idle > 0; idle -= 1
//!  free_list.pop() -> i
//!  slot[i]: Assigned(req); notify  ───▶  wake; Executing; req.execute()
//!                                        counter.complete()
//!                                        slot[i]: Idle
//!                                        free_list.push(i)
//!                                 ◀───   idle.lock; idle += 1; notify
//! ```
//!
//! A worker is pushed onto the free list before the idle count is bumped,
//! so a dispatcher that got past the count always finds an entry to pop.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use txlaunch_core::constants::MAX_POOL_SIZE;
use txlaunch_core::{kdebug, kerror, LaunchError, LaunchResult, Request, SlotState, WorkerError, WorkerId};

use crate::config::LauncherConfig;
use crate::launcher::{Launcher, LauncherCore};

/// Per-worker hand-off point
struct Slot {
    cell: Mutex<SlotCell>,
    wake: Condvar,
}

struct SlotCell {
    state: SlotState,
    request: Option<Request>,
}

/// State shared by the launcher and its workers
struct PoolShared {
    core: LauncherCore,
    slots: Box<[Slot]>,
    free_list: ArrayQueue<WorkerId>,
    idle: Mutex<usize>,
    idle_cond: Condvar,
    panics: AtomicU64,
}

#[inline]
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PoolShared {
    /// Take an idle worker off the free list, blocking until there is one
    fn acquire_worker(&self) -> WorkerId {
        {
            let mut idle = lock(&self.idle);
            while *idle == 0 {
                idle = self.idle_cond.wait(idle).unwrap_or_else(PoisonError::into_inner);
            }
            *idle -= 1;
        }
        // The matching push happened before the count was bumped
        loop {
            if let Some(id) = self.free_list.pop() {
                return id;
            }
            core::hint::spin_loop();
        }
    }

    /// Put a worker back: free list first, then the count
    fn release_worker(&self, id: WorkerId) {
        if self.free_list.push(id).is_err() {
            kerror!("{} returned to a full free list", id);
            return;
        }
        let mut idle = lock(&self.idle);
        *idle += 1;
        debug_assert!(*idle <= self.slots.len());
        drop(idle);
        self.idle_cond.notify_one();
    }

    /// Move an acquired worker out of `Idle` and wake it
    fn hand_off(&self, id: WorkerId, next: SlotState, request: Option<Request>) {
        let slot = &self.slots[id.as_usize()];
        let mut cell = lock(&slot.cell);
        debug_assert!(cell.state.can_become(next), "{}: {:?} -> {:?}", id, cell.state, next);
        cell.state = next;
        cell.request = request;
        drop(cell);
        slot.wake.notify_one();
    }
}

/// Launcher backed by a fixed pool of worker threads
pub struct ThreadPoolLauncher {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl ThreadPoolLauncher {
    /// Start `pool_size` workers, all idle
    pub fn new(pool_size: usize) -> LaunchResult<Self> {
        Self::with_config(&LauncherConfig::new().pool_size(pool_size))
    }

    pub fn with_config(config: &LauncherConfig) -> LaunchResult<Self> {
        let n = config.pool_size;
        if n == 0 || n > MAX_POOL_SIZE {
            return Err(LaunchError::InvalidConfig("pool_size must be in 1..=256"));
        }

        let slots: Box<[Slot]> = (0..n)
            .map(|_| Slot {
                cell: Mutex::new(SlotCell {
                    state: SlotState::Idle,
                    request: None,
                }),
                wake: Condvar::new(),
            })
            .collect();
        let free_list = ArrayQueue::new(n);
        for i in 0..n {
            let _ = free_list.push(WorkerId::new(i as u32));
        }

        let shared = Arc::new(PoolShared {
            core: LauncherCore::new(config.drain_spins)?,
            slots,
            free_list,
            idle: Mutex::new(n),
            idle_cond: Condvar::new(),
            panics: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(n);
        for i in 0..n {
            let id = WorkerId::new(i as u32);
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("txl-worker-{}", i))
                .spawn(move || worker_loop(worker_shared, id));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    kerror!("failed to spawn {}: {}", id, e);
                    // Everyone spawned so far is idle and still listed
                    for j in 0..handles.len() {
                        shared.hand_off(WorkerId::new(j as u32), SlotState::Stopped, None);
                    }
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(WorkerError::SpawnFailed.into());
                }
            }
        }

        kdebug!("thread pool started: {} workers", n);
        Ok(Self {
            shared,
            handles,
            stopped: false,
        })
    }

    /// Idle workers according to the count
    pub fn idle_count(&self) -> usize {
        *lock(&self.shared.idle)
    }

    /// Idle workers according to the free list
    ///
    /// Equals `idle_count()` whenever no dispatch or return is in flight.
    pub fn free_list_len(&self) -> usize {
        self.shared.free_list.len()
    }

    /// Requests whose execution panicked (still counted as completed)
    pub fn panics(&self) -> u64 {
        self.shared.panics.load(Ordering::Relaxed)
    }

    /// Current state of one worker
    pub fn worker_state(&self, id: WorkerId) -> Option<SlotState> {
        self.shared.slots.get(id.as_usize()).map(|s| lock(&s.cell).state)
    }
}

impl Launcher for ThreadPoolLauncher {
    fn execute_request(&self, req: Request) -> LaunchResult<()> {
        if self.stopped {
            return Err(LaunchError::ShutDown);
        }
        let id = self.shared.acquire_worker();
        self.shared.core.record_issued();
        self.shared.hand_off(id, SlotState::Assigned, Some(req));
        Ok(())
    }

    fn read_txns_executed(&self) -> u64 {
        self.shared.core.executed()
    }

    fn txns_issued(&self) -> u64 {
        self.shared.core.issued()
    }

    fn wait_outstanding(&self) {
        self.shared.core.wait_outstanding();
    }

    fn pool_size(&self) -> usize {
        self.shared.slots.len()
    }

    fn shutdown(&mut self) -> LaunchResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.shared.core.wait_outstanding();

        // Stop each worker through the idle protocol: only Idle -> Stopped
        for _ in 0..self.handles.len() {
            let id = self.shared.acquire_worker();
            self.shared.hand_off(id, SlotState::Stopped, None);
        }

        let mut result = Ok(());
        for h in self.handles.drain(..) {
            if h.join().is_err() {
                result = Err(WorkerError::Panicked.into());
            }
        }
        kdebug!(
            "thread pool stopped: {} executed, {} panicked",
            self.shared.core.executed(),
            self.panics()
        );
        result
    }

    fn name(&self) -> &'static str {
        "thread-pool"
    }
}

impl Drop for ThreadPoolLauncher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            kerror!("thread pool teardown: {}", e);
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, id: WorkerId) {
    let slot = &shared.slots[id.as_usize()];
    loop {
        let request = {
            let mut cell = lock(&slot.cell);
            loop {
                match cell.state {
                    SlotState::Assigned => break,
                    SlotState::Stopped => return,
                    SlotState::Idle | SlotState::Executing => {
                        cell = slot.wake.wait(cell).unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
            cell.state = SlotState::Executing;
            cell.request.take()
        };

        if let Some(req) = request {
            if panic::catch_unwind(AssertUnwindSafe(|| req.execute())).is_err() {
                shared.panics.fetch_add(1, Ordering::Relaxed);
                kerror!("{}: request panicked, records unlocked", id);
            }
        }
        shared.core.counter().complete();

        lock(&slot.cell).state = SlotState::Idle;
        shared.release_worker(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SharedStore;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use txlaunch_core::constants::FIELDS_PER_RECORD;
    use txlaunch_core::{Database, Record, RecordLock};

    fn ones() -> [u64; FIELDS_PER_RECORD] {
        [1; FIELDS_PER_RECORD]
    }

    /// Store whose key 0 blocks in `lock_record` until opened, and whose
    /// key 13 panics there
    struct GatedDb {
        records: Vec<Record>,
        locks: Vec<RecordLock>,
        open: AtomicBool,
    }

    impl GatedDb {
        fn new(n: usize) -> Arc<Self> {
            Arc::new(Self {
                records: (0..n).map(|_| Record::new()).collect(),
                locks: (0..n).map(|_| RecordLock::new()).collect(),
                open: AtomicBool::new(false),
            })
        }
    }

    impl Database for GatedDb {
        fn get_record(&self, key: u64) -> Option<&Record> {
            self.records.get(key as usize)
        }
        fn lock_record(&self, key: u64) {
            if key == 13 {
                panic!("injected lock failure");
            }
            if key == 0 {
                while !self.open.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            self.locks[key as usize].lock();
        }
        fn unlock_record(&self, key: u64) {
            self.locks[key as usize].unlock();
        }
        fn num_records(&self) -> u64 {
            self.records.len() as u64
        }
    }

    #[test]
    fn test_new_pool_all_idle() {
        let pool = ThreadPoolLauncher::new(4).unwrap();
        assert_eq!(pool.pool_size(), 4);
        assert_eq!(pool.idle_count(), 4);
        assert_eq!(pool.free_list_len(), 4);
        assert_eq!(pool.worker_state(WorkerId::new(3)), Some(SlotState::Idle));
        assert_eq!(pool.read_txns_executed(), 0);
    }

    #[test]
    fn test_rejects_bad_pool_size() {
        assert!(ThreadPoolLauncher::new(0).is_err());
        assert!(ThreadPoolLauncher::new(MAX_POOL_SIZE + 1).is_err());
    }

    #[test]
    fn test_disjoint_requests_exactly_once() {
        let store = Arc::new(SharedStore::new(32).unwrap());
        let pool = ThreadPoolLauncher::new(4).unwrap();

        for key in 0..10u64 {
            let mut deltas = [0u64; FIELDS_PER_RECORD];
            deltas[0] = key + 1;
            let req = Request::new(store.clone(), vec![key], deltas).unwrap();
            pool.execute_request(req).unwrap();
        }
        pool.wait_outstanding();

        assert_eq!(pool.read_txns_executed(), 10);
        assert_eq!(pool.txns_issued(), 10);
        for key in 0..10u64 {
            assert_eq!(store.snapshot(key).unwrap()[0], key + 1);
        }
        assert_eq!(store.snapshot(10).unwrap()[0], 0);
        assert_eq!(pool.idle_count(), 4);
        assert_eq!(pool.free_list_len(), 4);
    }

    #[test]
    fn test_overlapping_requests_from_two_dispatchers() {
        let store = Arc::new(SharedStore::new(16).unwrap());
        let pool = ThreadPoolLauncher::new(2).unwrap();
        let iters = 500u64;

        thread::scope(|s| {
            for (keys, delta) in [(vec![5u64, 7], 1u64), (vec![9u64, 7], 10u64)] {
                let pool = &pool;
                let store = &store;
                s.spawn(move || {
                    for _ in 0..iters {
                        let req = Request::new(store.clone(), keys.clone(), [delta; FIELDS_PER_RECORD]).unwrap();
                        pool.execute_request(req).unwrap();
                    }
                });
            }
        });
        pool.wait_outstanding();

        assert_eq!(pool.read_txns_executed(), 2 * iters);
        assert_eq!(store.snapshot(5).unwrap()[3], iters);
        assert_eq!(store.snapshot(7).unwrap()[3], iters * 11);
        assert_eq!(store.snapshot(9).unwrap()[3], iters * 10);
    }

    #[test]
    fn test_single_worker_blocks_second_dispatch() {
        let db = GatedDb::new(4);
        let pool = ThreadPoolLauncher::new(1).unwrap();
        let b_dispatched = AtomicBool::new(false);

        pool.execute_request(Request::new(db.clone(), vec![0], ones()).unwrap()).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                let req = Request::new(db.clone(), vec![1], ones()).unwrap();
                pool.execute_request(req).unwrap();
                b_dispatched.store(true, Ordering::Release);
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!b_dispatched.load(Ordering::Acquire));
            assert_eq!(pool.idle_count(), 0);

            db.open.store(true, Ordering::Release);
        });

        assert!(b_dispatched.load(Ordering::Acquire));
        pool.wait_outstanding();
        assert_eq!(pool.read_txns_executed(), 2);
        assert_eq!(db.records[0].field(0), 1);
        assert_eq!(db.records[1].field(0), 1);
    }

    #[test]
    fn test_idle_count_bounded_under_load() {
        let store = Arc::new(SharedStore::new(64).unwrap());
        let pool = ThreadPoolLauncher::new(3).unwrap();
        let mut total_keys = 0u64;

        for i in 0..2000u64 {
            let keys: Vec<u64> = (0..(i % 4 + 1)).map(|k| (i * 7 + k * 13) % 64).collect();
            total_keys += keys.len() as u64;
            let req = Request::new(store.clone(), keys, ones()).unwrap();
            pool.execute_request(req).unwrap();
            assert!(pool.idle_count() <= 3);
            assert!(pool.free_list_len() <= 3);
        }
        pool.wait_outstanding();

        assert_eq!(pool.read_txns_executed(), 2000);
        assert_eq!(store.field_sum(0), total_keys);
        assert_eq!(pool.idle_count(), pool.free_list_len());
    }

    #[test]
    fn test_panicking_request_still_completes() {
        let db = GatedDb::new(16);
        db.open.store(true, Ordering::Release);
        let pool = ThreadPoolLauncher::new(2).unwrap();

        pool.execute_request(Request::new(db.clone(), vec![12, 13], ones()).unwrap()).unwrap();
        pool.wait_outstanding();
        assert_eq!(pool.panics(), 1);
        // Key 12 was locked before the panic and must have been released
        assert!(!db.locks[12].is_locked());

        pool.execute_request(Request::new(db.clone(), vec![12], ones()).unwrap()).unwrap();
        pool.wait_outstanding();
        assert_eq!(pool.read_txns_executed(), 2);
        assert_eq!(db.records[12].field(0), 1);
    }

    #[test]
    fn test_shutdown_stops_workers() {
        let store = Arc::new(SharedStore::new(8).unwrap());
        let mut pool = ThreadPoolLauncher::new(3).unwrap();
        for key in 0..6u64 {
            pool.execute_request(Request::new(store.clone(), vec![key], ones()).unwrap()).unwrap();
        }

        pool.shutdown().unwrap();
        assert_eq!(pool.read_txns_executed(), 6);
        for i in 0..3 {
            assert_eq!(pool.worker_state(WorkerId::new(i)), Some(SlotState::Stopped));
        }

        let req = Request::new(store.clone(), vec![0], ones()).unwrap();
        assert_eq!(pool.execute_request(req), Err(LaunchError::ShutDown));
        assert_eq!(pool.txns_issued(), 6);
        assert!(pool.shutdown().is_ok());
    }
}
