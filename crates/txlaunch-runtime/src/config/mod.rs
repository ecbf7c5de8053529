//! Launcher configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`config::defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use txlaunch_runtime::config::{LauncherConfig, LauncherKind};
//!
//! let config = LauncherConfig::from_env()
//!     .kind(LauncherKind::Process)
//!     .pool_size(8);
//! config.validate()?;
//! ```

pub mod defaults;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use txlaunch_core::constants::MAX_POOL_SIZE;
use txlaunch_core::env::{env_get, env_get_opt};
use txlaunch_core::{kwarn, wire, LaunchError, LaunchResult};

/// Which launcher to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    /// Fixed pool of worker threads
    Thread,
    /// Fixed pool of forked worker processes
    Process,
    /// One forked process per request
    Fork,
}

impl LauncherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LauncherKind::Thread => "thread",
            LauncherKind::Process => "process",
            LauncherKind::Fork => "fork",
        }
    }
}

impl FromStr for LauncherKind {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" | "threads" => Ok(LauncherKind::Thread),
            "process" | "processes" | "proc" => Ok(LauncherKind::Process),
            "fork" => Ok(LauncherKind::Fork),
            _ => Err(LaunchError::InvalidConfig("launcher must be thread, process or fork")),
        }
    }
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launcher and benchmark configuration with builder pattern
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Launcher to build
    pub kind: LauncherKind,
    /// Workers per pool
    pub pool_size: usize,
    /// Bytes per process-pool worker buffer
    pub request_buf_size: usize,
    /// Concurrent children of the process-per-request launcher
    pub max_outstanding: usize,
    /// Yielding spins before a drain sleeps
    pub drain_spins: u32,
    /// Throughput samples per run
    pub samples: usize,
    /// Spacing between samples
    pub sample_period: Duration,
    /// Records in the benchmark store
    pub num_records: u64,
    /// Keys per benchmark transaction
    pub writes_per_txn: usize,
}

/// Library defaults; only `from_env` reads `TXL_*`
impl Default for LauncherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LauncherConfig {
    /// Library defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `TXL_LAUNCHER` - thread, process or fork
    /// - `TXL_POOL_SIZE` - workers per pool
    /// - `TXL_REQUEST_BUF_SIZE` - bytes per worker buffer
    /// - `TXL_MAX_OUTSTANDING` - concurrent children (fork launcher)
    /// - `TXL_DRAIN_SPINS` - spins before a drain sleeps
    /// - `TXL_SAMPLES` - throughput samples
    /// - `TXL_SAMPLE_PERIOD_MS` - sample spacing in milliseconds
    /// - `TXL_NUM_RECORDS` - benchmark store size
    /// - `TXL_WRITES_PER_TXN` - keys per benchmark transaction
    pub fn from_env() -> Self {
        let kind = match env_get_opt::<String>("TXL_LAUNCHER") {
            Some(name) => name.parse().unwrap_or_else(|_| {
                kwarn!("TXL_LAUNCHER={:?} not recognized, using {}", name, defaults::LAUNCHER);
                LauncherKind::Thread
            }),
            None => LauncherKind::Thread,
        };

        Self {
            kind,
            pool_size: env_get("TXL_POOL_SIZE", defaults::POOL_SIZE),
            request_buf_size: env_get("TXL_REQUEST_BUF_SIZE", defaults::REQUEST_BUF_SIZE),
            max_outstanding: env_get("TXL_MAX_OUTSTANDING", defaults::MAX_OUTSTANDING),
            drain_spins: env_get("TXL_DRAIN_SPINS", defaults::DRAIN_SPINS),
            samples: env_get("TXL_SAMPLES", defaults::SAMPLES),
            sample_period: Duration::from_millis(env_get(
                "TXL_SAMPLE_PERIOD_MS",
                defaults::SAMPLE_PERIOD_MS,
            )),
            num_records: env_get("TXL_NUM_RECORDS", defaults::NUM_RECORDS),
            writes_per_txn: env_get("TXL_WRITES_PER_TXN", defaults::WRITES_PER_TXN),
        }
    }

    /// Library defaults only (no env override)
    pub fn new() -> Self {
        Self {
            kind: LauncherKind::Thread,
            pool_size: defaults::POOL_SIZE,
            request_buf_size: defaults::REQUEST_BUF_SIZE,
            max_outstanding: defaults::MAX_OUTSTANDING,
            drain_spins: defaults::DRAIN_SPINS,
            samples: defaults::SAMPLES,
            sample_period: Duration::from_millis(defaults::SAMPLE_PERIOD_MS),
            num_records: defaults::NUM_RECORDS,
            writes_per_txn: defaults::WRITES_PER_TXN,
        }
    }

    // Builder methods

    pub fn kind(mut self, kind: LauncherKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn request_buf_size(mut self, bytes: usize) -> Self {
        self.request_buf_size = bytes;
        self
    }

    pub fn max_outstanding(mut self, n: usize) -> Self {
        self.max_outstanding = n;
        self
    }

    pub fn drain_spins(mut self, spins: u32) -> Self {
        self.drain_spins = spins;
        self
    }

    pub fn samples(mut self, n: usize) -> Self {
        self.samples = n;
        self
    }

    pub fn sample_period(mut self, d: Duration) -> Self {
        self.sample_period = d;
        self
    }

    pub fn num_records(mut self, n: u64) -> Self {
        self.num_records = n;
        self
    }

    pub fn writes_per_txn(mut self, n: usize) -> Self {
        self.writes_per_txn = n;
        self
    }

    /// Check the launcher fields
    ///
    /// The sampling and workload fields belong to the driver and are not
    /// checked here.
    pub fn validate(&self) -> LaunchResult<()> {
        if self.pool_size == 0 {
            return Err(LaunchError::InvalidConfig("pool_size must be > 0"));
        }
        if self.pool_size > MAX_POOL_SIZE {
            return Err(LaunchError::InvalidConfig("pool_size must be <= 256"));
        }
        if self.request_buf_size < wire::encoded_len(1) {
            return Err(LaunchError::InvalidConfig("request_buf_size cannot hold a one-key request"));
        }
        if self.request_buf_size % 8 != 0 {
            return Err(LaunchError::InvalidConfig("request_buf_size must be a multiple of 8"));
        }
        if self.max_outstanding == 0 {
            return Err(LaunchError::InvalidConfig("max_outstanding must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("txlaunch Configuration:");
        eprintln!("  launcher:          {}", self.kind);
        eprintln!("  pool_size:         {}", self.pool_size);
        eprintln!("  request_buf_size:  {}", self.request_buf_size);
        eprintln!("  max_outstanding:   {}", self.max_outstanding);
        eprintln!("  drain_spins:       {}", self.drain_spins);
        eprintln!("  samples:           {}", self.samples);
        eprintln!("  sample_period:     {:?}", self.sample_period);
        eprintln!("  num_records:       {}", self.num_records);
        eprintln!("  writes_per_txn:    {}", self.writes_per_txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = LauncherConfig::new();
        assert_eq!(config.kind, LauncherKind::Thread);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.request_buf_size, 1024);
        assert_eq!(config.samples, 60);
        assert_eq!(config.sample_period, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LauncherConfig::new()
            .kind(LauncherKind::Process)
            .pool_size(8)
            .sample_period(Duration::from_millis(250));

        assert_eq!(config.kind, LauncherKind::Process);
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.sample_period, Duration::from_millis(250));
    }

    #[test]
    fn test_validation() {
        assert!(LauncherConfig::new().pool_size(0).validate().is_err());
        assert!(LauncherConfig::new().pool_size(1000).validate().is_err());
        assert!(LauncherConfig::new().request_buf_size(16).validate().is_err());
        assert!(LauncherConfig::new().request_buf_size(1020).validate().is_err());
        assert!(LauncherConfig::new().max_outstanding(0).validate().is_err());

        // Workload fields are left to the driver
        let workload = LauncherConfig::new().samples(0).num_records(2).writes_per_txn(3);
        assert!(workload.kind(LauncherKind::Process).validate().is_ok());
    }

    #[test]
    fn test_default_ignores_env() {
        std::env::set_var("TXL_POOL_SIZE", "17");
        let config = LauncherConfig::default();
        std::env::remove_var("TXL_POOL_SIZE");
        assert_eq!(config.pool_size, defaults::POOL_SIZE);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("thread".parse::<LauncherKind>().unwrap(), LauncherKind::Thread);
        assert_eq!(" Process ".parse::<LauncherKind>().unwrap(), LauncherKind::Process);
        assert_eq!("fork".parse::<LauncherKind>().unwrap(), LauncherKind::Fork);
        assert!("green".parse::<LauncherKind>().is_err());
        assert_eq!(LauncherKind::Fork.to_string(), "fork");
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("TXL_SAMPLES", "7");
        let config = LauncherConfig::from_env();
        std::env::remove_var("TXL_SAMPLES");
        assert_eq!(config.samples, 7);
    }
}
