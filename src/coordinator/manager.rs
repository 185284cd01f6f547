//! Worker thread manager
//!
//! Owns the worker threads and the phase barrier. The coordinator drives a run
//! through it:
//!
//! 1. [`WorkerManager::prepare_threads`] spawns one thread per worker and waits
//!    until every worker allocated its buffers
//! 2. [`WorkerManager::run_phase`] once per selected phase
//! 3. [`WorkerManager::terminate`] lets the workers leave their threads
//!
//! While waiting for a phase the manager watches for the user interrupt signal
//! and the phase time limit, and interrupts all workers once either fires.

use crate::config::Config;
use crate::stats::histogram::LatencyHistogram;
use crate::stats::{LatencySummary, LiveOpsSnapshot, PhaseSummary, StoneWallStats};
use crate::target::BenchTargets;
use crate::worker::affinity;
use crate::worker::local::{LocalWorker, WorkerBackends};
use crate::worker::{thread_start, BenchId, BenchPhase, WorkerBase, WorkerStatus, WorkersSharedData};
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Interval between interrupt and time limit checks while workers are busy
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct WorkerManager {
    config: Arc<Config>,
    targets: Arc<BenchTargets>,
    backends: WorkerBackends,
    shared: Arc<WorkersSharedData>,
    threads: Vec<JoinHandle<()>>,

    phase: BenchPhase,
    phase_start: Instant,
    phase_start_time: DateTime<Local>,
    num_workers_done_with_error: usize,
    phase_time_expired: AtomicBool,
}

impl WorkerManager {
    pub fn new(config: Arc<Config>, targets: Arc<BenchTargets>) -> Self {
        let backends = WorkerBackends::from_config(&config);
        Self::with_backends(config, targets, backends)
    }

    pub fn with_backends(config: Arc<Config>, targets: Arc<BenchTargets>, backends: WorkerBackends) -> Self {
        let statuses = (0..config.workers.threads)
            .map(|rank| Arc::new(WorkerStatus::new(rank)))
            .collect();

        Self {
            config,
            targets,
            backends,
            shared: Arc::new(WorkersSharedData::new(statuses)),
            threads: Vec::new(),
            phase: BenchPhase::Idle,
            phase_start: Instant::now(),
            phase_start_time: Local::now(),
            num_workers_done_with_error: 0,
            phase_time_expired: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn num_workers(&self) -> usize {
        self.shared.num_workers()
    }

    pub fn statuses(&self) -> &[Arc<WorkerStatus>] {
        self.shared.workers()
    }

    pub fn current_phase(&self) -> BenchPhase {
        self.phase
    }

    /// Spawn all worker threads and wait for their preparation
    ///
    /// Fails if any worker could not be prepared. All threads are joined
    /// before the error is returned.
    pub fn prepare_threads(&mut self) -> Result<()> {
        let num_workers = self.num_workers();

        tracing::info!("Preparing {} worker thread(s)", num_workers);
        affinity::warn_if_oversubscribed(num_workers);

        for status in self.shared.workers().to_vec() {
            let rank = status.rank();
            let base = WorkerBase::new(self.config.clone(), self.shared.clone(), status);
            let worker = LocalWorker::new(base, self.targets.clone(), self.backends.clone())
                .with_context(|| format!("Worker {} creation failed", rank))?;

            let handle = std::thread::Builder::new()
                .name(format!("worker-{}", rank))
                .spawn(move || thread_start(worker))
                .with_context(|| format!("Failed to spawn worker thread {}", rank))?;

            self.threads.push(handle);
        }

        let (_, num_errors) = self.wait_for_workers_done()?;

        if num_errors > 0 {
            self.interrupt_and_notify_workers();
            self.join_all_threads();
            anyhow::bail!("Worker preparation failed. Workers with errors: {}", num_errors);
        }

        tracing::debug!("All workers prepared");
        Ok(())
    }

    /// Start `phase` on all workers
    ///
    /// All workers must have finished the previous phase.
    pub fn start_next_phase(&mut self, phase: BenchPhase) -> Result<BenchId> {
        let num_finished = self.shared.lock().num_workers_finished();
        if num_finished < self.num_workers() {
            anyhow::bail!(
                "Unable to start phase {}: only {} of {} workers finished the previous phase",
                phase,
                num_finished,
                self.num_workers()
            );
        }

        self.phase = phase;
        self.phase_start = Instant::now();
        self.phase_start_time = Local::now();
        self.num_workers_done_with_error = 0;

        tracing::debug!("Starting phase {}", phase);
        Ok(self.shared.start_next_phase(phase))
    }

    /// Wait until every worker finished the current phase
    ///
    /// Interrupts the workers once if the user interrupt signal arrives or the
    /// phase time limit expires, then keeps waiting for them to report back.
    /// Returns the done and done-with-error counters.
    pub fn wait_for_workers_done(&mut self) -> Result<(usize, usize)> {
        let num_workers = self.num_workers();
        let mut interrupted = false;

        loop {
            let (num_done, num_errors) = self
                .shared
                .wait_for_workers_finished(num_workers, WAIT_POLL_INTERVAL);

            if num_done + num_errors >= num_workers {
                self.num_workers_done_with_error = num_errors;
                return Ok((num_done, num_errors));
            }

            // workers count themselves done before leaving their thread
            if self.threads.iter().all(|t| t.is_finished()) {
                let (num_done, num_errors) = {
                    let state = self.shared.lock();
                    (state.num_workers_done, state.num_workers_done_with_error)
                };
                if num_done + num_errors >= num_workers {
                    self.num_workers_done_with_error = num_errors;
                    return Ok((num_done, num_errors));
                }
                anyhow::bail!(
                    "Worker threads exited before finishing phase {}. Done: {}; Errors: {}; Workers: {}",
                    self.phase,
                    num_done,
                    num_errors,
                    num_workers
                );
            }

            if interrupted {
                continue;
            }

            if super::user_interrupt_requested() {
                tracing::warn!("Interrupt signal received, interrupting workers");
                self.interrupt_and_notify_workers();
                interrupted = true;
            } else if self.check_phase_time_limit() {
                tracing::warn!("Phase time limit expired, interrupting workers");
                self.interrupt_and_notify_workers();
                interrupted = true;
            }
        }
    }

    /// Start `phase` and wait for all workers to finish it
    pub fn run_phase(&mut self, phase: BenchPhase) -> Result<(usize, usize)> {
        self.start_next_phase(phase)?;
        self.wait_for_workers_done()
    }

    /// Whether the current phase ran past the configured time limit
    ///
    /// Sets the expired flag, which stays set for the rest of the run.
    pub fn check_phase_time_limit(&self) -> bool {
        let limit = match self.config.runtime.phase_time_limit_secs {
            Some(secs) => Duration::from_secs(secs),
            None => return false,
        };

        if matches!(self.phase, BenchPhase::Idle | BenchPhase::Terminate) {
            return false;
        }

        if self.phase_start.elapsed() >= limit {
            self.phase_time_expired.store(true, Ordering::SeqCst);
            return true;
        }

        false
    }

    pub fn phase_time_expired(&self) -> bool {
        self.phase_time_expired.load(Ordering::SeqCst)
    }

    pub fn interrupt_and_notify_workers(&self) {
        self.shared.interrupt_and_notify_workers();
    }

    /// Let the workers leave their phase loop and join them
    pub fn terminate(&mut self) -> Result<()> {
        self.run_phase(BenchPhase::Terminate)?;
        self.join_all_threads();
        Ok(())
    }

    pub fn join_all_threads(&mut self) {
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked: {}", name);
            }
        }
    }

    /// Live entries and bytes of the current phase, summed over all workers
    pub fn get_phase_num_entries_and_bytes(&self) -> (u64, u64) {
        self.statuses().iter().fold((0, 0), |(entries, bytes), status| {
            let ops = status.live_ops().snapshot();
            (entries + ops.num_entries_done, bytes + ops.num_bytes_done)
        })
    }

    /// Aggregate the workers' results of the last finished phase
    pub fn phase_summary(&self) -> Result<PhaseSummary> {
        let mut totals = LiveOpsSnapshot::default();
        let mut io_latency = LatencyHistogram::new()?;
        let mut entry_latency = LatencyHistogram::new()?;
        let mut first_finish_ms = u64::MAX;
        let mut last_finish_ms = 0;
        let mut stonewall: Option<StoneWallStats> = None;

        for status in self.statuses() {
            if let Some(result) = status.phase_result() {
                totals += result.ops;
                io_latency.merge(&result.io_latency)?;
                entry_latency.merge(&result.entry_latency)?;
                first_finish_ms = first_finish_ms.min(result.elapsed_ms);
                last_finish_ms = last_finish_ms.max(result.elapsed_ms);
            }

            if let Some(worker_stonewall) = status.stonewall_stats() {
                let sum = stonewall.get_or_insert(StoneWallStats {
                    ops: LiveOpsSnapshot::default(),
                    elapsed_ms: worker_stonewall.elapsed_ms,
                });
                sum.ops += worker_stonewall.ops;
            }
        }

        if first_finish_ms == u64::MAX {
            first_finish_ms = 0;
        }

        Ok(PhaseSummary {
            phase: self.phase,
            start_time: self.phase_start_time.to_rfc3339(),
            num_workers: self.num_workers(),
            num_workers_done_with_error: self.num_workers_done_with_error,
            totals,
            first_finish_ms,
            last_finish_ms,
            stonewall,
            io_latency: LatencySummary::from_histogram(&io_latency),
            entry_latency: LatencySummary::from_histogram(&entry_latency),
        })
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.interrupt_and_notify_workers();
            self.join_all_threads();
        }
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("phase", &self.phase)
            .field("num_workers", &self.num_workers())
            .field("num_threads", &self.threads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockQueue;
    use crate::gpu::Unavailable;
    use tempfile::TempDir;

    fn dir_mode_manager(dir: &TempDir, config: Config) -> WorkerManager {
        let mut config = config;
        config.targets.bench_paths = vec![dir.path().to_path_buf()];
        let config = Arc::new(config);
        let targets = Arc::new(BenchTargets::prepare(&config.targets.bench_paths, config.workload.file_size, false, false).unwrap());
        WorkerManager::new(config, targets)
    }

    #[test]
    fn test_four_workers_write_and_read_dir_tree() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workers.threads = 4;
        config.targets.num_dirs = 1;
        config.targets.num_files = 2;
        config.workload.block_size = 64 * 1024;
        config.workload.file_size = 1024 * 1024;

        let mut mgr = dir_mode_manager(&dir, config);
        mgr.prepare_threads().unwrap();

        assert_eq!(mgr.run_phase(BenchPhase::CreateDirs).unwrap(), (4, 0));
        assert_eq!(mgr.run_phase(BenchPhase::CreateFiles).unwrap(), (4, 0));

        assert_eq!(mgr.current_phase(), BenchPhase::CreateFiles);
        let summary = mgr.phase_summary().unwrap();
        assert_eq!(summary.phase, BenchPhase::CreateFiles);
        assert_eq!(summary.totals.num_bytes_done, 8 * 1024 * 1024);
        assert_eq!(summary.totals.num_entries_done, 8);
        assert_eq!(summary.totals.num_iops_done, 8 * 16);
        assert_eq!(summary.num_workers_done_with_error, 0);
        assert!(summary.first_finish_ms <= summary.last_finish_ms);
        assert!(summary.stonewall.is_some());

        assert_eq!(mgr.run_phase(BenchPhase::ReadFiles).unwrap(), (4, 0));
        assert_eq!(mgr.get_phase_num_entries_and_bytes(), (8, 8 * 1024 * 1024));

        for rank in 0..4 {
            for file in 0..2 {
                let path = dir.path().join(format!("r{}/d0/f{}", rank, file));
                assert_eq!(std::fs::metadata(path).unwrap().len(), 1024 * 1024);
            }
        }

        mgr.terminate().unwrap();
        assert!(mgr.threads.is_empty());
    }

    #[test]
    fn test_start_while_phase_running_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workload.block_size = 4096;
        config.workload.file_size = 4 * 4096;
        config.workload.io_depth = 2;
        config.targets.bench_paths = vec![dir.path().to_path_buf()];

        let queue = MockQueue::new();
        queue.set_stalled(true);
        let config = Arc::new(config);
        let targets = Arc::new(BenchTargets::prepare(&config.targets.bench_paths, 4 * 4096, false, false).unwrap());
        let backends = WorkerBackends {
            gpu: Arc::new(Unavailable),
            queue_factory: queue.factory(),
        };
        let mut mgr = WorkerManager::with_backends(config, targets, backends);
        mgr.prepare_threads().unwrap();

        assert_eq!(mgr.run_phase(BenchPhase::CreateDirs).unwrap(), (1, 0));
        mgr.start_next_phase(BenchPhase::CreateFiles).unwrap();

        let err = mgr.start_next_phase(BenchPhase::ReadFiles).unwrap_err();
        assert!(err.to_string().contains("previous phase"));

        // dropping interrupts and joins the busy worker
        drop(mgr);
    }

    #[test]
    fn test_phase_time_limit_interrupts_stalled_workers() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workers.threads = 2;
        config.workload.block_size = 4096;
        config.workload.file_size = 4 * 4096;
        config.workload.io_depth = 4;
        config.runtime.phase_time_limit_secs = Some(1);
        config.targets.bench_paths = vec![dir.path().to_path_buf()];

        let queue = MockQueue::new();
        let config = Arc::new(config);
        let targets = Arc::new(BenchTargets::prepare(&config.targets.bench_paths, 4 * 4096, false, false).unwrap());
        let backends = WorkerBackends {
            gpu: Arc::new(Unavailable),
            queue_factory: queue.factory(),
        };
        let mut mgr = WorkerManager::with_backends(config, targets, backends);
        mgr.prepare_threads().unwrap();
        assert_eq!(mgr.run_phase(BenchPhase::CreateDirs).unwrap(), (2, 0));
        assert!(!mgr.phase_time_expired());

        queue.set_stalled(true);
        let start = Instant::now();
        let (done, errors) = mgr.run_phase(BenchPhase::CreateFiles).unwrap();

        assert_eq!((done, errors), (2, 0));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(mgr.phase_time_expired());
        assert!(mgr.statuses().iter().all(|s| s.is_interruption_requested()));

        // interrupted workers have left their threads
        mgr.join_all_threads();
    }

    #[test]
    fn test_invalid_numa_zone_fails_preparation() {
        if !affinity::is_numa_info_available() {
            return;
        }

        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workers.threads = 2;
        config.workers.numa_zones = vec![0, 999];

        let mut mgr = dir_mode_manager(&dir, config);
        let err = mgr.prepare_threads().unwrap_err();

        assert!(err.to_string().contains("Workers with errors: 1"));
        assert!(mgr.threads.is_empty());
    }

    #[test]
    fn test_drop_joins_idle_workers() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workers.threads = 3;
        config.workload.block_size = 0;

        let mut mgr = dir_mode_manager(&dir, config);
        mgr.prepare_threads().unwrap();
        assert_eq!(mgr.statuses().len(), 3);
        drop(mgr);
    }

    #[test]
    fn test_summary_before_any_phase_is_empty() {
        let dir = TempDir::new().unwrap();
        let mgr = dir_mode_manager(&dir, Config::default());

        let summary = mgr.phase_summary().unwrap();
        assert_eq!(summary.phase, BenchPhase::Idle);
        assert_eq!(summary.totals, LiveOpsSnapshot::default());
        assert_eq!(summary.first_finish_ms, 0);
        assert!(summary.stonewall.is_none());
    }
}
