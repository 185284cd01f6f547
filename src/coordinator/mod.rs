//! Run coordinator
//!
//! Drives one benchmark run from start to finish:
//!
//! 1. prepare all worker threads
//! 2. wait for the configured start time
//! 3. run the selected phases in order, collecting one summary per phase
//! 4. terminate and join the workers
//!
//! Between phases the coordinator stops early on an interrupt signal, an
//! expired phase time limit or, unless configured to continue, worker errors.

pub mod manager;

use crate::config::Config;
use crate::stats::PhaseSummary;
use crate::target::BenchTargets;
use crate::worker::local::WorkerBackends;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use manager::WorkerManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

static GOT_USER_INTERRUPT_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Set `flag`, returning true if it was already set
fn record_interrupt_signal(flag: &AtomicBool) -> bool {
    flag.swap(true, Ordering::SeqCst)
}

/// Route SIGINT and SIGTERM to the interrupt flag
///
/// The first signal lets workers stop at their next interruption check. A
/// second one exits right away.
pub fn install_signal_handlers() -> Result<()> {
    ctrlc::set_handler(|| {
        if record_interrupt_signal(&GOT_USER_INTERRUPT_SIGNAL) {
            tracing::warn!("Received second interrupt signal, exiting");
            std::process::exit(1);
        }
        tracing::warn!("Received interrupt signal, stopping workers");
    })
    .context("Failed to install signal handler")?;

    Ok(())
}

pub fn user_interrupt_requested() -> bool {
    GOT_USER_INTERRUPT_SIGNAL.load(Ordering::SeqCst)
}

/// Why a run stopped before all phases were done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    UserInterrupt,
    PhaseTimeLimit,
    WorkerErrors,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::UserInterrupt => write!(f, "Terminating due to interrupt signal."),
            AbortReason::PhaseTimeLimit => write!(f, "Terminating due to phase time limit."),
            AbortReason::WorkerErrors => write!(f, "Terminating due to worker errors."),
        }
    }
}

/// Result of a complete run
#[derive(Debug)]
pub struct RunOutcome {
    pub summaries: Vec<PhaseSummary>,
    pub aborted: Option<AbortReason>,
    /// Done-with-error reports summed over all phases
    pub num_worker_errors: usize,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_some() || self.num_worker_errors > 0 {
            1
        } else {
            0
        }
    }
}

pub struct Coordinator {
    config: Arc<Config>,
    manager: WorkerManager,
}

impl Coordinator {
    pub fn new(config: Arc<Config>, targets: Arc<BenchTargets>) -> Self {
        let manager = WorkerManager::new(config.clone(), targets);
        Self { config, manager }
    }

    pub fn with_backends(config: Arc<Config>, targets: Arc<BenchTargets>, backends: WorkerBackends) -> Self {
        let manager = WorkerManager::with_backends(config.clone(), targets, backends);
        Self { config, manager }
    }

    pub fn run(mut self) -> Result<RunOutcome> {
        self.manager.prepare_threads()?;
        self.wait_for_start_time()?;

        let mut outcome = RunOutcome {
            summaries: Vec::new(),
            aborted: None,
            num_worker_errors: 0,
        };

        for phase in self.config.phases.selected() {
            if let Some(reason) = self.check_interruption_between_phases() {
                outcome.aborted = Some(reason);
                break;
            }

            tracing::info!("Starting phase {}", phase);

            let (_, num_errors) = self.manager.run_phase(phase)?;
            let summary = self.manager.phase_summary()?;

            tracing::info!(
                "Phase {} done: entries={}, bytes={}, elapsed={}ms, errors={}",
                phase,
                summary.totals.num_entries_done,
                summary.totals.num_bytes_done,
                summary.last_finish_ms,
                num_errors
            );

            outcome.summaries.push(summary);
            outcome.num_worker_errors += num_errors;

            if let Some(reason) = self.check_interruption_between_phases() {
                outcome.aborted = Some(reason);
                break;
            }

            if num_errors > 0 && !self.config.runtime.continue_on_error {
                tracing::error!("{} worker(s) reported errors in phase {}", num_errors, phase);
                outcome.aborted = Some(AbortReason::WorkerErrors);
                break;
            }
        }

        match outcome.aborted {
            Some(reason @ (AbortReason::UserInterrupt | AbortReason::PhaseTimeLimit)) => {
                tracing::warn!("{}", reason);
                self.manager.interrupt_and_notify_workers();
                self.manager.join_all_threads();
            }
            Some(AbortReason::WorkerErrors) | None => self.manager.terminate()?,
        }

        Ok(outcome)
    }

    fn check_interruption_between_phases(&self) -> Option<AbortReason> {
        if user_interrupt_requested() {
            Some(AbortReason::UserInterrupt)
        } else if self.manager.phase_time_expired() {
            Some(AbortReason::PhaseTimeLimit)
        } else {
            None
        }
    }

    /// Sleep until the configured start time, if any
    fn wait_for_start_time(&self) -> Result<()> {
        let start_time = match self.config.runtime.start_time {
            Some(secs) => secs,
            None => return Ok(()),
        };

        let now = Utc::now().timestamp();
        if start_time < now {
            anyhow::bail!(
                "Defined start time has already passed. Start time: {}; Now: {}",
                start_time,
                now
            );
        }

        let start = DateTime::<Utc>::from_timestamp(start_time, 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid start time: {}", start_time))?;
        tracing::info!("Waiting for start time: {}", start.to_rfc3339());

        while Utc::now().timestamp() < start_time {
            if user_interrupt_requested() {
                anyhow::bail!("{}", AbortReason::UserInterrupt);
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        Ok(())
    }
}
