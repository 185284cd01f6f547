//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! A configuration is built once in `main`, validated, and then shared
//! read-only (behind an `Arc`) by the manager and all workers.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::engine::AsyncEngineKind;
use crate::gpu::{emulated::EmulatedGpu, GpuBackend, Unavailable};
use crate::offset::AccessPattern;
use crate::worker::BenchPhase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Complete run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub phases: PhaseSelection,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Data IO settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Bytes per IO operation
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Size of each file (dir mode) or of each shared file (file mode)
    #[serde(default)]
    pub file_size: u64,
    /// Operations in flight per worker, 1 means synchronous IO
    #[serde(default = "default_io_depth")]
    pub io_depth: usize,
    /// Async queue implementation for io_depth > 1
    #[serde(default)]
    pub aio_engine: AsyncEngineKind,
    #[serde(default)]
    pub access: AccessPattern,
    /// Bytes per file for random access, defaults to the file size
    pub random_amount: Option<u64>,
    /// Open files with O_DIRECT
    #[serde(default)]
    pub direct_io: bool,
    /// Truncate files when creating them
    #[serde(default)]
    pub truncate: bool,
}

fn default_block_size() -> u64 {
    1024 * 1024
}

fn default_io_depth() -> usize {
    1
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            file_size: 0,
            io_depth: default_io_depth(),
            aio_engine: AsyncEngineKind::default(),
            access: AccessPattern::default(),
            random_amount: None,
            direct_io: false,
            truncate: false,
        }
    }
}

/// Where IO goes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsConfig {
    /// Directories, files or block devices (all of the same type)
    #[serde(default)]
    pub bench_paths: Vec<PathBuf>,
    /// Dirs per worker (dir mode)
    #[serde(default = "default_one")]
    pub num_dirs: usize,
    /// Files per dir (dir mode)
    #[serde(default = "default_one")]
    pub num_files: usize,
    /// Tolerate missing entries in delete phases
    #[serde(default)]
    pub ignore_del_errors: bool,
    /// GPUs for IO buffers, assigned round-robin by worker rank
    #[serde(default)]
    pub gpu_ids: Vec<i32>,
    /// Transfer directly between storage and GPU memory
    #[serde(default)]
    pub use_cufile: bool,
    #[serde(default)]
    pub gpu_backend: GpuBackendKind,
}

fn default_one() -> usize {
    1
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            bench_paths: Vec::new(),
            num_dirs: default_one(),
            num_files: default_one(),
            ignore_del_errors: false,
            gpu_ids: Vec::new(),
            use_cufile: false,
            gpu_backend: GpuBackendKind::default(),
        }
    }
}

/// GPU backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuBackendKind {
    /// No GPU support, any GPU use fails at worker setup
    #[default]
    None,
    /// Device memory emulated in host memory
    Emulated,
}

impl GpuBackendKind {
    pub fn build(&self) -> Arc<dyn GpuBackend> {
        match self {
            GpuBackendKind::None => Arc::new(Unavailable),
            GpuBackendKind::Emulated => Arc::new(EmulatedGpu::new()),
        }
    }
}

/// Worker thread settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// NUMA zones to bind workers to, assigned round-robin by rank
    #[serde(default)]
    pub numa_zones: Vec<u32>,
}

fn default_threads() -> usize {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            numa_zones: Vec::new(),
        }
    }
}

/// Which phases to run, always in the fixed order of [`PhaseSelection::selected`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSelection {
    #[serde(default)]
    pub create_dirs: bool,
    #[serde(default)]
    pub create_files: bool,
    #[serde(default)]
    pub read_files: bool,
    #[serde(default)]
    pub stat_files: bool,
    #[serde(default)]
    pub delete_files: bool,
    #[serde(default)]
    pub delete_dirs: bool,
}

impl PhaseSelection {
    pub fn selected(&self) -> Vec<BenchPhase> {
        [
            (self.create_dirs, BenchPhase::CreateDirs),
            (self.create_files, BenchPhase::CreateFiles),
            (self.read_files, BenchPhase::ReadFiles),
            (self.stat_files, BenchPhase::StatFiles),
            (self.delete_files, BenchPhase::DeleteFiles),
            (self.delete_dirs, BenchPhase::DeleteDirs),
        ]
        .into_iter()
        .filter_map(|(enabled, phase)| enabled.then_some(phase))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.selected().is_empty()
    }

    pub fn has_data_phase(&self) -> bool {
        self.create_files || self.read_files
    }

    pub fn has_dir_phase(&self) -> bool {
        self.create_dirs || self.delete_dirs
    }
}

/// Run control
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Interrupt a phase after this many seconds
    pub phase_time_limit_secs: Option<u64>,
    /// Wait until this UNIX timestamp (seconds) before the first phase
    pub start_time: Option<i64>,
    /// Run the remaining phases even if workers reported errors
    #[serde(default)]
    pub continue_on_error: bool,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "  Workload: {}", self.workload)?;
        writeln!(f, "  Targets: {}", self.targets)?;
        writeln!(f, "  Workers: {}", self.workers)?;
        writeln!(f, "  Phases: {}", self.phases)?;
        Ok(())
    }
}

impl fmt::Display for WorkloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block_size={}, file_size={}, io_depth={}, access={:?}",
            self.block_size, self.file_size, self.io_depth, self.access
        )?;
        if self.io_depth > 1 {
            write!(f, ", engine={}", self.aio_engine)?;
        }
        if let Some(amount) = self.random_amount {
            write!(f, ", random_amount={}", amount)?;
        }
        if self.direct_io {
            write!(f, ", direct")?;
        }
        Ok(())
    }
}

impl fmt::Display for TargetsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} path(s), dirs={}, files={}",
            self.bench_paths.len(),
            self.num_dirs,
            self.num_files
        )?;
        if !self.gpu_ids.is_empty() {
            write!(f, ", gpus={:?}", self.gpu_ids)?;
        }
        if self.use_cufile {
            write!(f, ", cufile")?;
        }
        Ok(())
    }
}

impl fmt::Display for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} thread(s)", self.threads)?;
        if !self.numa_zones.is_empty() {
            write!(f, ", numa_zones={:?}", self.numa_zones)?;
        }
        Ok(())
    }
}

impl fmt::Display for PhaseSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.selected().iter().map(|p| p.to_string()).collect();
        write!(f, "{}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.workload.block_size, 1024 * 1024);
        assert_eq!(config.workload.io_depth, 1);
        assert_eq!(config.workers.threads, 1);
        assert_eq!(config.targets.num_dirs, 1);
        assert!(config.phases.is_empty());
    }

    #[test]
    fn test_phase_order_is_fixed() {
        let phases = PhaseSelection {
            delete_dirs: true,
            read_files: true,
            create_dirs: true,
            ..Default::default()
        };

        assert_eq!(
            phases.selected(),
            vec![BenchPhase::CreateDirs, BenchPhase::ReadFiles, BenchPhase::DeleteDirs]
        );
        assert!(phases.has_data_phase());
        assert!(phases.has_dir_phase());
    }

    #[test]
    fn test_gpu_backend_none_is_unavailable() {
        let backend = GpuBackendKind::None.build();
        assert!(backend.alloc_buffer(0, 16).is_err());

        let backend = GpuBackendKind::Emulated.build();
        assert!(backend.alloc_buffer(0, 16).is_ok());
    }
}
