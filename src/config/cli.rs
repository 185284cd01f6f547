//! CLI argument parsing using clap
//!
//! Every workload option is optional so that values from a TOML file are only
//! overridden when given on the command line.

use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;

/// Phase-synchronized multi-threaded storage IO exerciser
#[derive(Parser, Debug, Default)]
#[command(name = "phasebench")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Bench paths: directories, files or block devices (all of the same type)
    #[arg(value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Phases ===
    /// Create directories
    #[arg(short = 'd', long = "mkdirs")]
    pub create_dirs: bool,

    /// Create and write files
    #[arg(short = 'w', long = "write")]
    pub create_files: bool,

    /// Read files
    #[arg(short = 'r', long = "read")]
    pub read_files: bool,

    /// Stat files
    #[arg(long = "stat")]
    pub stat_files: bool,

    /// Delete files
    #[arg(short = 'F', long = "delfiles")]
    pub delete_files: bool,

    /// Delete directories
    #[arg(short = 'D', long = "deldirs")]
    pub delete_dirs: bool,

    // === Basic Options ===
    /// Number of worker threads
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Block size for IO operations (e.g., 4k, 1M)
    #[arg(short = 'b', long)]
    pub block_size: Option<String>,

    /// File size (e.g., 1G, 100M)
    #[arg(short = 's', long)]
    pub file_size: Option<String>,

    /// Number of directories per worker (dir mode)
    #[arg(short = 'n', long)]
    pub num_dirs: Option<usize>,

    /// Number of files per directory (dir mode)
    #[arg(short = 'N', long)]
    pub num_files: Option<usize>,

    // === IO Options ===
    /// Operations in flight per worker (1 = synchronous IO)
    #[arg(long = "iodepth")]
    pub io_depth: Option<usize>,

    /// Async IO engine for iodepth > 1
    #[arg(long, value_enum)]
    pub aio_engine: Option<EngineType>,

    /// Random offsets (block aligned)
    #[arg(long = "rand")]
    pub random: bool,

    /// Random offsets without block alignment
    #[arg(long = "rand-unaligned")]
    pub random_unaligned: bool,

    /// Bytes per file to read or write with random offsets (e.g., 512M)
    #[arg(long = "rand-amount")]
    pub random_amount: Option<String>,

    /// Use direct IO (O_DIRECT)
    #[arg(long)]
    pub direct: bool,

    /// Truncate files on creation
    #[arg(long = "trunc")]
    pub truncate: bool,

    /// Ignore missing entries in delete phases
    #[arg(long = "nodelerr")]
    pub ignore_del_errors: bool,

    // === GPU Options ===
    /// Comma-separated GPU IDs for IO buffers (e.g., "0,1")
    #[arg(long = "gpuids")]
    pub gpu_ids: Option<String>,

    /// Transfer directly between storage and GPU memory
    #[arg(long)]
    pub cufile: bool,

    /// GPU backend
    #[arg(long, value_enum)]
    pub gpu_backend: Option<GpuBackendType>,

    // === Worker Options ===
    /// Comma-separated NUMA zones to bind workers to (e.g., "0,1")
    #[arg(long = "zones")]
    pub numa_zones: Option<String>,

    // === Runtime Options ===
    /// Time limit per phase (e.g., 60s, 5m)
    #[arg(long = "timelimit")]
    pub phase_time_limit: Option<String>,

    /// Start time as UNIX timestamp in seconds
    #[arg(long = "start")]
    pub start_time: Option<i64>,

    /// Run remaining phases after worker errors
    #[arg(long)]
    pub continue_on_error: bool,

    /// Print phase summaries as JSON
    #[arg(long)]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn any_phase_selected(&self) -> bool {
        self.create_dirs
            || self.create_files
            || self.read_files
            || self.stat_files
            || self.delete_files
            || self.delete_dirs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineType {
    Libaio,
    #[value(name = "io_uring")]
    IoUring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GpuBackendType {
    None,
    Emulated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_phases_and_options() {
        let cli = Cli::try_parse_from([
            "phasebench", "-w", "-r", "-t", "4", "-b", "4k", "-s", "1M", "--iodepth", "16",
            "--aio-engine", "io_uring", "--gpuids", "0,1", "/tmp/a", "/tmp/b",
        ])
        .unwrap();

        assert!(cli.create_files && cli.read_files);
        assert!(!cli.delete_files);
        assert_eq!(cli.threads, Some(4));
        assert_eq!(cli.io_depth, Some(16));
        assert_eq!(cli.aio_engine, Some(EngineType::IoUring));
        assert_eq!(cli.paths.len(), 2);
        assert!(cli.any_phase_selected());
    }

    #[test]
    fn test_verbose_counts() {
        let cli = Cli::try_parse_from(["phasebench", "-vv", "/tmp/x"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(!cli.any_phase_selected());
    }
}
