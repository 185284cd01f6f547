//! Phase barrier shared by all workers of a run
//!
//! One [`WorkersSharedData`] is created by the manager before the first worker
//! thread starts and is dropped only after all threads have joined. All of its
//! mutable state lives behind a single mutex:
//!
//! - the current bench id and phase, changed once per phase transition
//! - the done and done-with-error counters, reset at every phase start
//! - the stonewall flag, so the snapshot is taken once per phase
//!
//! Workers block on the condition variable until the bench id changes. Every
//! counter update broadcasts, so the manager can wait on the same condition for
//! all workers to finish.

use super::{BenchId, BenchPhase, WorkerError, WorkerResult, WorkerStatus};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// State protected by the phase barrier mutex
#[derive(Debug)]
pub struct PhaseState {
    pub bench_id: BenchId,
    pub phase: BenchPhase,
    pub phase_start: Instant,
    pub num_workers_done: usize,
    pub num_workers_done_with_error: usize,
    pub stonewall_triggered: bool,
}

impl PhaseState {
    pub fn num_workers_finished(&self) -> usize {
        self.num_workers_done + self.num_workers_done_with_error
    }
}

pub struct WorkersSharedData {
    state: Mutex<PhaseState>,
    condition: Condvar,
    /// Roster of all workers, used for stonewall capture and interruption
    workers: Vec<Arc<WorkerStatus>>,
}

impl WorkersSharedData {
    pub fn new(workers: Vec<Arc<WorkerStatus>>) -> Self {
        Self {
            state: Mutex::new(PhaseState {
                bench_id: BenchId::NIL,
                phase: BenchPhase::Idle,
                phase_start: Instant::now(),
                num_workers_done: 0,
                num_workers_done_with_error: 0,
                stonewall_triggered: false,
            }),
            condition: Condvar::new(),
            workers,
        }
    }

    /// Lock the phase state
    ///
    /// A worker that panicked while holding the lock leaves the counters intact,
    /// so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, PhaseState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn workers(&self) -> &[Arc<WorkerStatus>] {
        &self.workers
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Switch all workers to `phase`
    ///
    /// Resets the counters and every worker's live stats, then wakes all
    /// workers waiting for the next phase.
    pub fn start_next_phase(&self, phase: BenchPhase) -> BenchId {
        let mut state = self.lock();

        state.bench_id = state.bench_id.next();
        state.phase = phase;
        state.num_workers_done = 0;
        state.num_workers_done_with_error = 0;
        state.stonewall_triggered = false;

        for worker in &self.workers {
            worker.reset_phase_stats();
        }

        state.phase_start = Instant::now();
        let bench_id = state.bench_id;

        self.condition.notify_all();

        bench_id
    }

    /// Block until the bench id differs from `old_bench_id`
    ///
    /// `check_interruption` runs before the first wait and after every wakeup.
    pub fn wait_for_next_phase<F>(
        &self,
        old_bench_id: BenchId,
        check_interruption: F,
    ) -> WorkerResult<(BenchId, BenchPhase, Instant)>
    where
        F: Fn() -> WorkerResult<()>,
    {
        let mut state = self.lock();

        check_interruption()?;

        while state.bench_id == old_bench_id {
            state = self.condition.wait(state).unwrap_or_else(|e| e.into_inner());
            check_interruption()?;
        }

        Ok((state.bench_id, state.phase, state.phase_start))
    }

    /// Count one worker as done with the current phase
    ///
    /// The first worker to finish triggers the stonewall snapshot of every
    /// worker in the roster.
    pub fn inc_num_workers_done(&self) {
        let mut state = self.lock();

        state.num_workers_done += 1;

        if state.num_workers_done == 1 && !state.stonewall_triggered {
            state.stonewall_triggered = true;

            let elapsed_ms = state.phase_start.elapsed().as_millis() as u64;
            for worker in &self.workers {
                worker.capture_stonewall_stats(elapsed_ms);
            }
        }

        self.condition.notify_all();
    }

    pub fn inc_num_workers_done_with_error(&self) {
        let mut state = self.lock();
        state.num_workers_done_with_error += 1;
        self.condition.notify_all();
    }

    /// Wait until `num_workers` reported back or `timeout` expires
    ///
    /// Returns the done and done-with-error counters.
    pub fn wait_for_workers_finished(&self, num_workers: usize, timeout: Duration) -> (usize, usize) {
        let state = self.lock();

        let (state, _) = self
            .condition
            .wait_timeout_while(state, timeout, |s| s.num_workers_finished() < num_workers)
            .unwrap_or_else(|e| e.into_inner());

        (state.num_workers_done, state.num_workers_done_with_error)
    }

    /// Set every worker's interruption flag and wake waiting workers
    pub fn interrupt_and_notify_workers(&self) {
        for worker in &self.workers {
            worker.request_interruption();
        }

        let _state = self.lock();
        self.condition.notify_all();
    }
}

impl std::fmt::Debug for WorkersSharedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkersSharedData")
            .field("state", &*self.lock())
            .field("num_workers", &self.workers.len())
            .finish()
    }
}

/// Interruption check used by workers waiting on the barrier
pub(crate) fn interruption_check(status: &WorkerStatus) -> WorkerResult<()> {
    if status.is_interruption_requested() {
        return Err(WorkerError::Interrupted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn roster(n: usize) -> Vec<Arc<WorkerStatus>> {
        (0..n).map(|rank| Arc::new(WorkerStatus::new(rank))).collect()
    }

    #[test]
    fn test_start_next_phase_resets_counters() {
        let shared = WorkersSharedData::new(roster(2));

        shared.inc_num_workers_done();
        shared.inc_num_workers_done_with_error();

        let first = shared.start_next_phase(BenchPhase::CreateFiles);
        let state = shared.lock();
        assert_ne!(first, BenchId::NIL);
        assert_eq!(state.phase, BenchPhase::CreateFiles);
        assert_eq!(state.num_workers_done, 0);
        assert_eq!(state.num_workers_done_with_error, 0);
        assert!(!state.stonewall_triggered);
        drop(state);

        let second = shared.start_next_phase(BenchPhase::ReadFiles);
        assert_ne!(first, second);
    }

    #[test]
    fn test_every_worker_observes_one_transition() {
        let workers = roster(4);
        let shared = Arc::new(WorkersSharedData::new(workers.clone()));
        let (tx, rx) = mpsc::channel();

        let handles: Vec<_> = workers
            .iter()
            .map(|status| {
                let shared = shared.clone();
                let status = status.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = shared.wait_for_next_phase(BenchId::NIL, || interruption_check(&status));
                    tx.send(result.map(|(id, phase, _)| (id, phase))).unwrap();
                })
            })
            .collect();

        // nobody may pass the barrier before the id changes
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let id = shared.start_next_phase(BenchPhase::ReadFiles);

        for _ in 0..4 {
            let (seen_id, phase) = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert_eq!(seen_id, id);
            assert_eq!(phase, BenchPhase::ReadFiles);
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_stonewall_triggers_once_per_phase() {
        let workers = roster(3);
        let shared = WorkersSharedData::new(workers.clone());

        shared.start_next_phase(BenchPhase::CreateFiles);
        workers[1].live_ops().add_bytes(4096);
        workers[1].live_ops().add_iops(1);
        workers[1].live_ops().add_io_latency(Duration::from_micros(250));

        shared.inc_num_workers_done();
        let captured: Vec<_> = workers.iter().map(|w| w.stonewall_stats()).collect();
        assert!(captured.iter().all(|s| s.is_some()));
        assert_eq!(captured[1].map(|s| s.ops.num_bytes_done), Some(4096));
        assert_eq!(captured[1].map(|s| s.ops.mean_io_latency_us()), Some(250));

        // later finishers must not overwrite the snapshot
        workers[1].live_ops().add_bytes(4096);
        shared.inc_num_workers_done();
        shared.inc_num_workers_done();
        assert_eq!(workers[1].stonewall_stats().map(|s| s.ops.num_bytes_done), Some(4096));

        // the counter going back to 1 without a new phase doesn't retrigger
        shared.lock().num_workers_done = 0;
        shared.inc_num_workers_done();
        assert_eq!(workers[1].stonewall_stats().map(|s| s.ops.num_bytes_done), Some(4096));

        shared.start_next_phase(BenchPhase::ReadFiles);
        assert!(workers.iter().all(|w| w.stonewall_stats().is_none()));
    }

    #[test]
    fn test_errors_do_not_trigger_stonewall() {
        let workers = roster(2);
        let shared = WorkersSharedData::new(workers.clone());

        shared.start_next_phase(BenchPhase::ReadFiles);
        shared.inc_num_workers_done_with_error();

        assert!(!shared.lock().stonewall_triggered);
        assert!(workers[0].stonewall_stats().is_none());
    }

    #[test]
    fn test_interrupt_wakes_all_waiting_workers() {
        let workers = roster(4);
        let shared = Arc::new(WorkersSharedData::new(workers.clone()));
        let (tx, rx) = mpsc::channel();

        let handles: Vec<_> = workers
            .iter()
            .map(|status| {
                let shared = shared.clone();
                let status = status.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = shared.wait_for_next_phase(BenchId::NIL, || interruption_check(&status));
                    tx.send(result.map(|_| ())).unwrap();
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        shared.interrupt_and_notify_workers();

        for _ in 0..4 {
            let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(matches!(result, Err(WorkerError::Interrupted)));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // still interrupted after a real transition
        shared.start_next_phase(BenchPhase::CreateFiles);
        let result = shared.wait_for_next_phase(BenchId::NIL, || interruption_check(&workers[0]));
        assert!(matches!(result, Err(WorkerError::Interrupted)));
    }

    #[test]
    fn test_wait_for_workers_finished_times_out() {
        let shared = WorkersSharedData::new(roster(2));
        shared.start_next_phase(BenchPhase::StatFiles);
        shared.inc_num_workers_done();

        let (done, errors) = shared.wait_for_workers_finished(2, Duration::from_millis(10));
        assert_eq!((done, errors), (1, 0));

        shared.inc_num_workers_done_with_error();
        let (done, errors) = shared.wait_for_workers_finished(2, Duration::from_millis(10));
        assert_eq!((done, errors), (1, 1));
    }
}
