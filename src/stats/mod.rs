//! Statistics collection
//!
//! Workers publish progress through cache-line aligned atomic counters that the
//! manager can read at any time without locking ([`LiveOps`]). Per-phase latency
//! histograms stay private to the worker until the phase is finished and are
//! then handed over in a [`PhaseSummary`].
//!
//! # Stonewall
//!
//! When the first worker of a phase finishes, every worker's live counters are
//! captured in a [`StoneWallStats`] snapshot. Comparing the snapshot totals with
//! the final totals shows how much of the work ran while all workers were still
//! busy.
//!
//! ```
//! use phasebench::stats::LiveOps;
//!
//! let ops = LiveOps::new();
//! ops.add_iops(1);
//! ops.add_bytes(4096);
//!
//! let snap = ops.snapshot();
//! assert_eq!(snap.num_iops_done, 1);
//! assert_eq!(snap.num_bytes_done, 4096);
//! ```

pub mod histogram;

use crate::util::format::per_second;
use crate::worker::BenchPhase;
use histogram::LatencyHistogram;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cache-line aligned atomic counter
///
/// Each worker updates its own counters while the manager reads them. Padding
/// every counter to 64 bytes keeps those updates from invalidating each other's
/// cache lines.
///
/// ```text
/// [value: 8 bytes][padding: 56 bytes] = 64 bytes total
/// ```
#[repr(align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Live progress counters of one worker in the current phase
#[derive(Debug, Default)]
pub struct LiveOps {
    num_entries_done: AlignedCounter,
    num_bytes_done: AlignedCounter,
    num_iops_done: AlignedCounter,
    io_latency_us: AlignedCounter,
}

impl LiveOps {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_entries(&self, n: u64) {
        self.num_entries_done.add(n);
    }

    #[inline]
    pub fn add_bytes(&self, n: u64) {
        self.num_bytes_done.add(n);
    }

    #[inline]
    pub fn add_iops(&self, n: u64) {
        self.num_iops_done.add(n);
    }

    /// Add the latency of one completed block IO
    #[inline]
    pub fn add_io_latency(&self, elapsed: Duration) {
        self.io_latency_us.add(elapsed.as_micros() as u64);
    }

    pub fn snapshot(&self) -> LiveOpsSnapshot {
        LiveOpsSnapshot {
            num_entries_done: self.num_entries_done.get(),
            num_bytes_done: self.num_bytes_done.get(),
            num_iops_done: self.num_iops_done.get(),
            io_latency_us: self.io_latency_us.get(),
        }
    }

    pub fn reset(&self) {
        self.num_entries_done.set(0);
        self.num_bytes_done.set(0);
        self.num_iops_done.set(0);
        self.io_latency_us.set(0);
    }
}

/// Point-in-time copy of [`LiveOps`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LiveOpsSnapshot {
    pub num_entries_done: u64,
    pub num_bytes_done: u64,
    pub num_iops_done: u64,
    /// Summed latency of all completed block IOs
    pub io_latency_us: u64,
}

impl LiveOpsSnapshot {
    pub fn mean_io_latency_us(&self) -> u64 {
        if self.num_iops_done == 0 {
            0
        } else {
            self.io_latency_us / self.num_iops_done
        }
    }
}

impl std::ops::AddAssign for LiveOpsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.num_entries_done += other.num_entries_done;
        self.num_bytes_done += other.num_bytes_done;
        self.num_iops_done += other.num_iops_done;
        self.io_latency_us += other.io_latency_us;
    }
}

/// Worker throughput and latency counters captured when the first worker
/// finished the phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoneWallStats {
    pub ops: LiveOpsSnapshot,
    /// Milliseconds since phase start at capture time
    pub elapsed_ms: u64,
}

/// Latency digest for reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_us: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    pub fn from_histogram(hist: &LatencyHistogram) -> Self {
        let us = |d: Option<Duration>| d.map(|d| d.as_micros() as u64).unwrap_or(0);

        Self {
            count: hist.len(),
            min_us: us(hist.min()),
            mean_us: us(hist.mean()),
            p50_us: us(hist.percentile(50.0)),
            p99_us: us(hist.percentile(99.0)),
            max_us: us(hist.max()),
        }
    }
}

/// Final result of one worker for one phase
#[derive(Debug, Clone)]
pub struct WorkerPhaseResult {
    pub elapsed_ms: u64,
    pub ops: LiveOpsSnapshot,
    pub io_latency: LatencyHistogram,
    pub entry_latency: LatencyHistogram,
}

/// Aggregated outcome of one phase across all workers
#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub phase: BenchPhase,
    /// Local wall clock time when the phase was started (RFC 3339)
    pub start_time: String,
    pub num_workers: usize,
    pub num_workers_done_with_error: usize,
    pub totals: LiveOpsSnapshot,
    /// Elapsed time of the fastest and slowest worker
    pub first_finish_ms: u64,
    pub last_finish_ms: u64,
    /// Sum of all stonewall snapshots, if the stonewall was triggered
    pub stonewall: Option<StoneWallStats>,
    pub io_latency: LatencySummary,
    pub entry_latency: LatencySummary,
}

impl PhaseSummary {
    /// Bytes per second over the slowest worker's runtime
    pub fn throughput(&self) -> f64 {
        per_second(self.totals.num_bytes_done, self.last_finish_ms)
    }

    pub fn iops(&self) -> f64 {
        per_second(self.totals.num_iops_done, self.last_finish_ms)
    }

    pub fn entries_per_sec(&self) -> f64 {
        per_second(self.totals.num_entries_done, self.last_finish_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_counter_layout() {
        assert_eq!(std::mem::size_of::<AlignedCounter>(), 64);
        assert_eq!(std::mem::align_of::<AlignedCounter>(), 64);
    }

    #[test]
    fn test_live_ops_snapshot_and_reset() {
        let ops = LiveOps::new();
        ops.add_entries(3);
        ops.add_bytes(8192);
        ops.add_iops(2);
        ops.add_io_latency(Duration::from_micros(30));
        ops.add_io_latency(Duration::from_micros(50));

        let snap = ops.snapshot();
        assert_eq!(
            snap,
            LiveOpsSnapshot {
                num_entries_done: 3,
                num_bytes_done: 8192,
                num_iops_done: 2,
                io_latency_us: 80,
            }
        );
        assert_eq!(snap.mean_io_latency_us(), 40);

        ops.reset();
        assert_eq!(ops.snapshot(), LiveOpsSnapshot::default());
    }

    #[test]
    fn test_snapshot_add_assign() {
        let mut total = LiveOpsSnapshot::default();
        total += LiveOpsSnapshot {
            num_entries_done: 1,
            num_bytes_done: 10,
            num_iops_done: 2,
            io_latency_us: 100,
        };
        total += LiveOpsSnapshot {
            num_entries_done: 4,
            num_bytes_done: 5,
            num_iops_done: 6,
            io_latency_us: 60,
        };
        assert_eq!(total.num_entries_done, 5);
        assert_eq!(total.num_bytes_done, 15);
        assert_eq!(total.num_iops_done, 8);
        assert_eq!(total.mean_io_latency_us(), 20);
    }

    #[test]
    fn test_latency_summary_of_empty_histogram() {
        let hist = LatencyHistogram::new().unwrap();
        assert_eq!(LatencySummary::from_histogram(&hist), LatencySummary::default());
    }

    #[test]
    fn test_phase_summary_rates() {
        let summary = PhaseSummary {
            phase: BenchPhase::ReadFiles,
            start_time: String::new(),
            num_workers: 2,
            num_workers_done_with_error: 0,
            totals: LiveOpsSnapshot {
                num_entries_done: 10,
                num_bytes_done: 2048,
                num_iops_done: 4,
                io_latency_us: 0,
            },
            first_finish_ms: 500,
            last_finish_ms: 2000,
            stonewall: None,
            io_latency: LatencySummary::default(),
            entry_latency: LatencySummary::default(),
        };

        assert_eq!(summary.throughput(), 1024.0);
        assert_eq!(summary.iops(), 2.0);
        assert_eq!(summary.entries_per_sec(), 5.0);

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"phase\":\"read_files\""));
    }
}
