//! Worker threads
//!
//! A worker is one OS thread that lives for the whole run. It waits on the
//! shared phase barrier, runs its share of the current phase, reports back and
//! waits again:
//!
//! ```text
//! Created -> WaitingForPhase -> Running -> PhaseDone | ErrorDone -> WaitingForPhase -> ... -> Joined
//! ```
//!
//! # Architecture
//!
//! - [`WorkersSharedData`]: the phase barrier (bench id, done counters, stonewall)
//! - [`WorkerStatus`]: the part of a worker that other threads may look at
//!   (interruption flag, live counters, stonewall snapshot, phase result)
//! - [`WorkerBase`]: lifecycle helpers shared by all worker kinds
//! - [`Worker`]: a concrete worker kind, implemented by [`local::LocalWorker`]
//!
//! Cancellation is polled: the manager sets the interruption flag and
//! broadcasts, and the worker notices it at its next barrier wait, block IO or
//! reap timeout.

pub mod affinity;
pub mod error;
pub mod local;
pub mod shared;
pub mod strategy;

pub use error::{WorkerError, WorkerResult, WorkerResultExt};
pub use shared::WorkersSharedData;

use crate::config::Config;
use crate::stats::{LiveOps, StoneWallStats, WorkerPhaseResult};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Globally synchronized benchmark stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchPhase {
    /// Preparation, before the first real phase
    Idle,
    /// Workers exit their threads
    Terminate,
    CreateDirs,
    DeleteDirs,
    CreateFiles,
    ReadFiles,
    StatFiles,
    DeleteFiles,
}

impl BenchPhase {
    /// Phases that transfer file data
    pub fn is_data_phase(&self) -> bool {
        matches!(self, BenchPhase::CreateFiles | BenchPhase::ReadFiles)
    }

    pub fn is_dir_phase(&self) -> bool {
        matches!(self, BenchPhase::CreateDirs | BenchPhase::DeleteDirs)
    }
}

impl fmt::Display for BenchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BenchPhase::Idle => "IDLE",
            BenchPhase::Terminate => "TERMINATE",
            BenchPhase::CreateDirs => "MKDIRS",
            BenchPhase::DeleteDirs => "RMDIRS",
            BenchPhase::CreateFiles => "WRITE",
            BenchPhase::ReadFiles => "READ",
            BenchPhase::StatFiles => "STAT",
            BenchPhase::DeleteFiles => "RMFILES",
        };
        f.write_str(name)
    }
}

/// Identifier of one phase transition, `NIL` before the first phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BenchId(u64);

impl BenchId {
    pub const NIL: BenchId = BenchId(0);

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    pub(crate) fn next(self) -> Self {
        BenchId(self.0.wrapping_add(1).max(1))
    }
}

/// Cross-thread view of one worker
///
/// Owned jointly by the worker and the manager. The interruption flag is set at
/// most once and never cleared.
#[derive(Debug)]
pub struct WorkerStatus {
    rank: usize,
    interruption_requested: AtomicBool,
    live_ops: LiveOps,
    stonewall: Mutex<Option<StoneWallStats>>,
    phase_result: Mutex<Option<WorkerPhaseResult>>,
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl WorkerStatus {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            interruption_requested: AtomicBool::new(false),
            live_ops: LiveOps::new(),
            stonewall: Mutex::new(None),
            phase_result: Mutex::new(None),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn request_interruption(&self) {
        self.interruption_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_interruption_requested(&self) -> bool {
        self.interruption_requested.load(Ordering::SeqCst)
    }

    pub fn live_ops(&self) -> &LiveOps {
        &self.live_ops
    }

    /// Snapshot the live counters as of the first finisher
    pub fn capture_stonewall_stats(&self, elapsed_ms: u64) {
        *lock_ignoring_poison(&self.stonewall) = Some(StoneWallStats {
            ops: self.live_ops.snapshot(),
            elapsed_ms,
        });
    }

    pub fn stonewall_stats(&self) -> Option<StoneWallStats> {
        *lock_ignoring_poison(&self.stonewall)
    }

    pub fn set_phase_result(&self, result: WorkerPhaseResult) {
        *lock_ignoring_poison(&self.phase_result) = Some(result);
    }

    pub fn phase_result(&self) -> Option<WorkerPhaseResult> {
        lock_ignoring_poison(&self.phase_result).clone()
    }

    /// Clear everything a phase accumulates, called while all workers are idle
    pub(crate) fn reset_phase_stats(&self) {
        self.live_ops.reset();
        *lock_ignoring_poison(&self.stonewall) = None;
        *lock_ignoring_poison(&self.phase_result) = None;
    }
}

/// A concrete worker kind
pub trait Worker: Send {
    fn base(&self) -> &WorkerBase;

    /// Phase loop, returns when the worker terminates or is interrupted
    fn run(&mut self);
}

/// Thread entry point
pub fn thread_start<W: Worker>(mut worker: W) {
    let rank = worker.base().rank();
    let span = tracing::debug_span!("worker", rank);
    let _enter = span.enter();

    tracing::debug!("Worker thread started");
    worker.run();
    tracing::debug!("Worker thread exiting");
}

/// Lifecycle helpers shared by all worker kinds
#[derive(Debug)]
pub struct WorkerBase {
    config: Arc<Config>,
    shared: Arc<WorkersSharedData>,
    status: Arc<WorkerStatus>,
}

impl WorkerBase {
    pub fn new(config: Arc<Config>, shared: Arc<WorkersSharedData>, status: Arc<WorkerStatus>) -> Self {
        Self { config, shared, status }
    }

    pub fn rank(&self) -> usize {
        self.status.rank()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared(&self) -> &WorkersSharedData {
        &self.shared
    }

    pub fn status(&self) -> &WorkerStatus {
        &self.status
    }

    /// Fail with [`WorkerError::Interrupted`] once interruption was requested
    #[inline]
    pub fn check_interruption(&self) -> WorkerResult<()> {
        shared::interruption_check(&self.status)
    }

    /// Block until the manager starts a phase other than `old_bench_id`
    pub fn wait_for_next_phase(&self, old_bench_id: BenchId) -> WorkerResult<(BenchId, BenchPhase, Instant)> {
        self.shared
            .wait_for_next_phase(old_bench_id, || self.check_interruption())
    }

    /// Bind the calling thread to this worker's NUMA zone
    ///
    /// No-op without configured zones or without NUMA info on this system.
    pub fn apply_numa_binding(&self) -> WorkerResult<()> {
        let zone = match affinity::numa_zone_for_rank(&self.config.workers.numa_zones, self.rank()) {
            Some(zone) => zone,
            None => return Ok(()),
        };

        if !affinity::is_numa_info_available() {
            tracing::debug!("No NUMA info available, skipping binding to zone {}", zone);
            return Ok(());
        }

        affinity::bind_to_numa_zone(zone).setup_err()
    }

    pub fn inc_num_workers_done(&self) {
        self.shared.inc_num_workers_done();
    }

    pub fn inc_num_workers_done_with_error(&self) {
        self.shared.inc_num_workers_done_with_error();
    }
}
