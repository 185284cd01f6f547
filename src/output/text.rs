//! Human-readable text output

use crate::stats::{LatencySummary, PhaseSummary};
use crate::util::format::{format_bytes, format_duration, format_throughput};
use std::fmt::Write;
use std::time::Duration;

/// Render the summaries of a run as a table, one row per phase
///
/// Stonewall columns show the totals as of the first finished worker.
pub fn format_phase_summaries(summaries: &[PhaseSummary]) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{:<8} {:>10} {:>12} {:>14} {:>12} {:>14} {:>10} {:>12}",
        "PHASE", "TIME", "ENTRIES", "ENTRIES/s", "DATA", "THROUGHPUT", "IOPS", "ERRORS"
    );

    for summary in summaries {
        let _ = writeln!(
            out,
            "{:<8} {:>10} {:>12} {:>14.1} {:>12} {:>14} {:>10.0} {:>12}",
            summary.phase.to_string(),
            format_duration(Duration::from_millis(summary.last_finish_ms)),
            summary.totals.num_entries_done,
            summary.entries_per_sec(),
            format_bytes(summary.totals.num_bytes_done),
            format_throughput(summary.throughput()),
            summary.iops(),
            summary.num_workers_done_with_error
        );

        if let Some(stonewall) = summary.stonewall {
            let _ = writeln!(
                out,
                "{:<8} {:>10} {:>12} {:>14} {:>12}   avg lat {}",
                "  first",
                format_duration(Duration::from_millis(stonewall.elapsed_ms)),
                stonewall.ops.num_entries_done,
                "",
                format_bytes(stonewall.ops.num_bytes_done),
                format_duration(Duration::from_micros(stonewall.ops.mean_io_latency_us()))
            );
        }

        write_latency(&mut out, "  IO lat", &summary.io_latency);
        write_latency(&mut out, "  entry lat", &summary.entry_latency);
    }

    out
}

fn write_latency(out: &mut String, label: &str, lat: &LatencySummary) {
    if lat.count == 0 {
        return;
    }

    let us = Duration::from_micros;
    let _ = writeln!(
        out,
        "{:<10} min={} avg={} p50={} p99={} max={} ({} samples)",
        label,
        format_duration(us(lat.min_us)),
        format_duration(us(lat.mean_us)),
        format_duration(us(lat.p50_us)),
        format_duration(us(lat.p99_us)),
        format_duration(us(lat.max_us)),
        lat.count
    );
}

pub fn print_phase_summaries(summaries: &[PhaseSummary]) {
    print!("{}", format_phase_summaries(summaries));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{LiveOpsSnapshot, StoneWallStats};
    use crate::worker::BenchPhase;

    fn summary() -> PhaseSummary {
        PhaseSummary {
            phase: BenchPhase::CreateFiles,
            start_time: "2026-01-01T00:00:00+00:00".to_string(),
            num_workers: 2,
            num_workers_done_with_error: 0,
            totals: LiveOpsSnapshot {
                num_entries_done: 4,
                num_bytes_done: 8 * 1024 * 1024,
                num_iops_done: 128,
                io_latency_us: 128 * 50,
            },
            first_finish_ms: 900,
            last_finish_ms: 1000,
            stonewall: Some(StoneWallStats {
                ops: LiveOpsSnapshot {
                    num_entries_done: 3,
                    num_bytes_done: 6 * 1024 * 1024,
                    num_iops_done: 96,
                    io_latency_us: 96 * 40,
                },
                elapsed_ms: 900,
            }),
            io_latency: LatencySummary {
                count: 128,
                min_us: 10,
                mean_us: 50,
                p50_us: 40,
                p99_us: 200,
                max_us: 300,
            },
            entry_latency: LatencySummary::default(),
        }
    }

    #[test]
    fn test_table_rows() {
        let out = format_phase_summaries(&[summary()]);
        let lines: Vec<&str> = out.lines().collect();

        assert!(lines[0].starts_with("PHASE"));
        assert!(lines[1].starts_with("WRITE"));
        assert!(lines[1].contains("8.00 MiB"));
        assert!(lines[1].contains("8.00 MiB/s"));
        assert!(lines[2].contains("6.00 MiB"));
        assert!(lines[2].contains("avg lat 40.00us"));
        assert!(lines[3].contains("p99=200.00us"));

        // no entry latency line without samples
        assert_eq!(lines.len(), 4);
    }
}
