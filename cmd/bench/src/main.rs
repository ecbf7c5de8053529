//! Transaction launcher throughput benchmark
//!
//! Builds a shared record store and the launcher selected by `TXL_LAUNCHER`,
//! issues random transactions until the throughput monitor has taken all
//! its samples, then prints per-sample and summary throughput.
//!
//! All knobs come from the environment (see `LauncherConfig::from_env`):
//!
//! ```text
//! TXL_LAUNCHER=process TXL_POOL_SIZE=8 TXL_SAMPLES=10 bench
//! ```

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;

use txlaunch::constants::FIELDS_PER_RECORD;
use txlaunch::{
    build, kerror, kinfo, wire, Database, LaunchError, LaunchResult, Launcher, LauncherConfig,
    LauncherKind, PerfMonitor, Request, SharedStore, ThroughputSummary, WorkerError,
};

/// xorshift64* generator; quality is irrelevant, speed is not
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// `n` distinct keys below `bound`, ascending
    fn write_set(&mut self, n: usize, bound: u64) -> Vec<u64> {
        let mut keys = Vec::with_capacity(n);
        while keys.len() < n {
            let k = self.next() % bound;
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        keys.sort_unstable();
        keys
    }
}

fn main() -> ExitCode {
    println!("=== txlaunch Benchmark ===\n");

    let config = LauncherConfig::from_env();
    config.print();

    match run(&config) {
        Ok(()) => {
            println!("\n=== Benchmark Complete ===");
            ExitCode::SUCCESS
        }
        Err(e) => {
            kerror!("benchmark failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Checks on the workload knobs, which the launchers themselves never read
fn check_workload(config: &LauncherConfig) -> LaunchResult<()> {
    if config.samples == 0 {
        return Err(LaunchError::InvalidConfig("samples must be > 0"));
    }
    if config.sample_period.is_zero() {
        return Err(LaunchError::InvalidConfig("sample_period must be > 0"));
    }
    if config.writes_per_txn == 0 {
        return Err(LaunchError::InvalidConfig("writes_per_txn must be > 0"));
    }
    if config.num_records < config.writes_per_txn as u64 {
        return Err(LaunchError::InvalidConfig("num_records must be >= writes_per_txn"));
    }
    if config.kind == LauncherKind::Process
        && wire::encoded_len(config.writes_per_txn) > config.request_buf_size
    {
        return Err(LaunchError::InvalidConfig(
            "request_buf_size too small for writes_per_txn",
        ));
    }
    Ok(())
}

fn run(config: &LauncherConfig) -> LaunchResult<()> {
    config.validate()?;
    check_workload(config)?;

    let store = Arc::new(SharedStore::new(config.num_records)?);
    let db: Arc<dyn Database> = store.clone();
    let mut launcher = build(config, db.clone())?;

    kinfo!(
        "{} launcher, {} workers, {} keys/txn over {} records",
        launcher.name(),
        launcher.pool_size(),
        config.writes_per_txn,
        config.num_records
    );

    let monitor = PerfMonitor::from_config(config);
    let stop = AtomicBool::new(false);
    let start = Instant::now();

    let (dispatched, samples) = thread::scope(|s| {
        let (launcher, stop) = (&*launcher, &stop);
        let perf = thread::Builder::new()
            .name("txl-perf".into())
            .spawn_scoped(s, move || monitor.run_until(launcher, stop));
        let perf = match perf {
            Ok(h) => h,
            Err(_) => return (Err(WorkerError::SpawnFailed.into()), Vec::new()),
        };
        let dispatched = dispatch(launcher, &db, config, &perf);
        if dispatched.is_err() {
            stop.store(true, Ordering::Release);
        }
        (dispatched, perf.join().unwrap_or_default())
    });

    if let Err(e) = dispatched {
        kerror!("dispatch failed: {}, shutting down", e);
        if let Err(stop_err) = launcher.shutdown() {
            kerror!("shutdown after failed dispatch: {}", stop_err);
        }
        return Err(e);
    }

    launcher.wait_outstanding();
    let elapsed = start.elapsed();
    let issued = launcher.txns_issued();
    let executed = launcher.read_txns_executed();

    println!("\nSamples (txns/sec)");
    println!("{}", "─".repeat(40));
    for (i, s) in samples.iter().enumerate() {
        println!("  [{:>3}]  {:>12.0}", i, s);
    }

    println!("\n=== Results ===");
    println!("Launcher:        {}", launcher.name());
    println!("Issued:          {}", issued);
    println!("Executed:        {}", executed);
    println!("Total time:      {:?}", elapsed);
    println!("Throughput:      {:.0} txns/sec", executed as f64 / elapsed.as_secs_f64());
    if let Some(summary) = ThroughputSummary::from_samples(&samples) {
        println!("Sample mean:     {:.0} txns/sec", summary.mean);
        println!("Sample min:      {:.0} txns/sec", summary.min);
        println!("Sample max:      {:.0} txns/sec", summary.max);
    }

    // Each txn added 1 to field 0 of every key it wrote
    let expected = executed * config.writes_per_txn as u64;
    let applied = store.field_sum(0);
    if applied != expected {
        kerror!("field sum {} != {} (executed x writes)", applied, expected);
    }

    launcher.shutdown()
}

/// Issue random transactions until the monitor has all its samples
fn dispatch(
    launcher: &dyn Launcher,
    db: &Arc<dyn Database>,
    config: &LauncherConfig,
    perf: &ScopedJoinHandle<'_, Vec<f64>>,
) -> LaunchResult<()> {
    let mut rng = XorShift::new(0x9E37_79B9_7F4A_7C15 ^ std::process::id() as u64);
    let deltas = [1u64; FIELDS_PER_RECORD];
    while !perf.is_finished() {
        let keys = rng.write_set(config.writes_per_txn, config.num_records);
        launcher.execute_request(Request::new(db.clone(), keys, deltas)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_write_set_distinct_sorted() {
        let mut rng = XorShift::new(7);
        for _ in 0..100 {
            let keys = rng.write_set(4, 6);
            assert_eq!(keys.len(), 4);
            assert!(keys.windows(2).all(|w| w[0] < w[1]), "{:?}", keys);
            assert!(keys.iter().all(|&k| k < 6));
        }
    }

    #[test]
    fn test_check_workload() {
        let ok = LauncherConfig::new().samples(2).num_records(10).writes_per_txn(4);
        assert!(check_workload(&ok).is_ok());

        assert!(check_workload(&ok.clone().samples(0)).is_err());
        assert!(check_workload(&ok.clone().sample_period(Duration::ZERO)).is_err());
        assert!(check_workload(&ok.clone().writes_per_txn(0)).is_err());
        assert!(check_workload(&ok.clone().num_records(3)).is_err());
    }

    #[test]
    fn test_check_workload_request_fits_buffer() {
        let config = LauncherConfig::new()
            .kind(LauncherKind::Process)
            .num_records(1000)
            .writes_per_txn(64)
            .request_buf_size(wire::encoded_len(1));
        assert!(config.validate().is_ok());
        assert!(check_workload(&config).is_err());

        // Thread workers never serialize
        assert!(check_workload(&config.kind(LauncherKind::Thread)).is_ok());
    }
}
