//! JSON output formatting
//!
//! The report carries the raw phase summaries plus human-readable rates, so
//! it can be read by people and post-processed by scripts alike.

use crate::coordinator::RunOutcome;
use crate::stats::PhaseSummary;
use crate::util::format::format_throughput;
use crate::Result;
use serde::Serialize;

/// Throughput with bytes/sec and human-readable format
#[derive(Debug, Clone, Serialize)]
pub struct JsonThroughput {
    pub bytes_per_sec: u64,
    pub human: String,
}

impl JsonThroughput {
    pub fn new(bytes_per_sec: f64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec as u64,
            human: format_throughput(bytes_per_sec),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonPhase<'a> {
    #[serde(flatten)]
    pub summary: &'a PhaseSummary,
    pub throughput: JsonThroughput,
    pub iops: f64,
    pub entries_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRunReport<'a> {
    pub version: &'static str,
    pub phases: Vec<JsonPhase<'a>>,
    /// Reason the run stopped early, if it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub num_worker_errors: usize,
    pub exit_code: i32,
}

impl<'a> JsonRunReport<'a> {
    pub fn new(outcome: &'a RunOutcome) -> Self {
        let phases = outcome
            .summaries
            .iter()
            .map(|summary| JsonPhase {
                summary,
                throughput: JsonThroughput::new(summary.throughput()),
                iops: summary.iops(),
                entries_per_sec: summary.entries_per_sec(),
            })
            .collect();

        Self {
            version: env!("CARGO_PKG_VERSION"),
            phases,
            aborted: outcome.aborted.map(|reason| reason.to_string()),
            num_worker_errors: outcome.num_worker_errors,
            exit_code: outcome.exit_code(),
        }
    }
}

pub fn format_run_report(outcome: &RunOutcome) -> Result<String> {
    Ok(serde_json::to_string_pretty(&JsonRunReport::new(outcome))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::AbortReason;
    use crate::stats::{LatencySummary, LiveOpsSnapshot};
    use crate::worker::BenchPhase;

    #[test]
    fn test_report_fields() {
        let outcome = RunOutcome {
            summaries: vec![PhaseSummary {
                phase: BenchPhase::ReadFiles,
                start_time: String::new(),
                num_workers: 1,
                num_workers_done_with_error: 1,
                totals: LiveOpsSnapshot {
                    num_entries_done: 0,
                    num_bytes_done: 2048,
                    num_iops_done: 2,
                    io_latency_us: 0,
                },
                first_finish_ms: 1000,
                last_finish_ms: 1000,
                stonewall: None,
                io_latency: LatencySummary::default(),
                entry_latency: LatencySummary::default(),
            }],
            aborted: Some(AbortReason::WorkerErrors),
            num_worker_errors: 1,
        };

        let value: serde_json::Value = serde_json::from_str(&format_run_report(&outcome).unwrap()).unwrap();

        let phase = &value["phases"][0];
        assert_eq!(phase["phase"], "read_files");
        assert_eq!(phase["totals"]["num_bytes_done"], 2048);
        assert_eq!(phase["throughput"]["bytes_per_sec"], 2048);
        assert_eq!(phase["throughput"]["human"], "2.00 KiB/s");
        assert_eq!(value["aborted"], "Terminating due to worker errors.");
        assert_eq!(value["exit_code"], 1);
    }
}
