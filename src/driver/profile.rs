//! Per-kernel run counts and runtimes, collected when the engine runs in
//! debug mode (every launch is synchronized and timed).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Accumulated statistics of one kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub runs: u64,
    pub total: Duration,
}

impl KernelStats {
    pub fn average(&self) -> Duration {
        if self.runs == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / self.runs as u128;
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Kernel statistics keyed by kernel name.
#[derive(Debug, Default)]
pub struct KernelProfile {
    kernels: Mutex<BTreeMap<&'static str, KernelStats>>,
}

impl KernelProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kernel: &'static str, elapsed: Duration) {
        if let Ok(mut kernels) = self.kernels.lock() {
            let stats = kernels.entry(kernel).or_default();
            stats.runs += 1;
            stats.total += elapsed;
        }
    }

    pub fn snapshot(&self) -> ProfileReport {
        let kernels = self
            .kernels
            .lock()
            .map(|kernels| kernels.iter().map(|(name, stats)| (*name, *stats)).collect())
            .unwrap_or_default();
        ProfileReport { kernels }
    }

    pub fn reset(&self) {
        if let Ok(mut kernels) = self.kernels.lock() {
            kernels.clear();
        }
    }
}

/// Point-in-time copy of a [`KernelProfile`], sorted by kernel name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileReport {
    pub kernels: Vec<(&'static str, KernelStats)>,
}

impl ProfileReport {
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn total_runs(&self) -> u64 {
        self.kernels.iter().map(|(_, stats)| stats.runs).sum()
    }

    pub fn total_time(&self) -> Duration {
        self.kernels.iter().map(|(_, stats)| stats.total).sum()
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, stats) in &self.kernels {
            writeln!(
                f,
                "Kernel {:<24} executed {:>6} times, with average runtime: {:>8}us\tand total runtime: {:>8}us",
                name,
                stats.runs,
                stats.average().as_micros(),
                stats.total.as_micros(),
            )?;
        }
        write!(
            f,
            "Ran {} kernels with cumulative runtime: {}us",
            self.total_runs(),
            self.total_time().as_micros()
        )
    }
}
