//! Throughput sampling
//!
//! Reads a launcher's executed counter once per period and turns the
//! deltas into transactions per second. Rates divide by the measured
//! `Instant` interval, not the nominal period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use txlaunch_core::{kdebug, ktrace};

use crate::config::LauncherConfig;
use crate::launcher::Launcher;

/// Periodic sampler of `read_txns_executed`
#[derive(Debug, Clone, Copy)]
pub struct PerfMonitor {
    samples: usize,
    period: Duration,
}

impl PerfMonitor {
    pub fn new(samples: usize, period: Duration) -> Self {
        Self { samples, period }
    }

    pub fn from_config(config: &LauncherConfig) -> Self {
        Self::new(config.samples, config.sample_period)
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Take `samples` throughput samples, one per period
    pub fn run(&self, launcher: &dyn Launcher) -> Vec<f64> {
        self.run_until(launcher, &AtomicBool::new(false))
    }

    /// Like `run`, but returns the samples taken so far once `stop` is set
    pub fn run_until(&self, launcher: &dyn Launcher, stop: &AtomicBool) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.samples);
        let mut last_count = launcher.read_txns_executed();
        let mut last_time = Instant::now();

        for _ in 0..self.samples {
            if !sleep_unless(last_time + self.period, stop) {
                kdebug!("monitor stopped after {} sample(s)", out.len());
                break;
            }
            let now = Instant::now();
            let count = launcher.read_txns_executed();

            let secs = now.duration_since(last_time).as_secs_f64();
            let delta = count.saturating_sub(last_count);
            let rate = if secs > 0.0 { delta as f64 / secs } else { 0.0 };
            ktrace!("sample {}: {} txns, {:.0}/s", out.len(), delta, rate);
            out.push(rate);

            last_count = count;
            last_time = now;
        }
        out
    }

}

/// Sleep until `deadline` in short slices; false if `stop` was raised first
fn sleep_unless(deadline: Instant, stop: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(10);
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLICE));
    }
}

/// Mean, min and max over a run's samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}

impl ThroughputSummary {
    /// `None` for an empty run
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let (min, max, sum) = samples.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(lo, hi, sum), &s| (lo.min(s), hi.max(s), sum + s),
        );
        let summary = Self {
            mean: sum / samples.len() as f64,
            min,
            max,
            samples: samples.len(),
        };
        kdebug!("{:?}", summary);
        Some(summary)
    }
}
