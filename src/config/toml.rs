//! TOML configuration file parsing
//!
//! ```toml
//! [workload]
//! block_size = 4096
//! file_size = 1048576
//! io_depth = 16
//! aio_engine = "io_uring"
//!
//! [targets]
//! bench_paths = ["/mnt/nvme0/bench", "/mnt/nvme1/bench"]
//! num_dirs = 2
//! num_files = 100
//!
//! [workers]
//! threads = 8
//!
//! [phases]
//! create_dirs = true
//! create_files = true
//! read_files = true
//! ```

use super::cli::Cli;
use super::cli_convert::{convert_engine_type, convert_gpu_backend, parse_duration, parse_id_list, parse_size};
use super::*;
use crate::offset::AccessPattern;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments into a configuration (CLI takes precedence)
///
/// Phase flags given on the command line replace the configured phase
/// selection as a whole. Bench paths given on the command line replace the
/// configured ones.
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    if !cli.paths.is_empty() {
        config.targets.bench_paths = cli.paths.clone();
    }

    if cli.any_phase_selected() {
        config.phases = PhaseSelection {
            create_dirs: cli.create_dirs,
            create_files: cli.create_files,
            read_files: cli.read_files,
            stat_files: cli.stat_files,
            delete_files: cli.delete_files,
            delete_dirs: cli.delete_dirs,
        };
    }

    // Workload
    if let Some(ref s) = cli.block_size {
        config.workload.block_size = parse_size(s)?;
    }
    if let Some(ref s) = cli.file_size {
        config.workload.file_size = parse_size(s)?;
    }
    if let Some(depth) = cli.io_depth {
        config.workload.io_depth = depth;
    }
    if let Some(engine) = cli.aio_engine {
        config.workload.aio_engine = convert_engine_type(engine);
    }
    if cli.random_unaligned {
        config.workload.access = AccessPattern::RandomUnaligned;
    } else if cli.random {
        config.workload.access = AccessPattern::RandomAligned;
    }
    if let Some(ref s) = cli.random_amount {
        config.workload.random_amount = Some(parse_size(s)?);
    }
    config.workload.direct_io |= cli.direct;
    config.workload.truncate |= cli.truncate;

    // Targets
    if let Some(n) = cli.num_dirs {
        config.targets.num_dirs = n;
    }
    if let Some(n) = cli.num_files {
        config.targets.num_files = n;
    }
    config.targets.ignore_del_errors |= cli.ignore_del_errors;
    if let Some(ref s) = cli.gpu_ids {
        config.targets.gpu_ids = parse_id_list(s)?;
    }
    config.targets.use_cufile |= cli.cufile;
    if let Some(backend) = cli.gpu_backend {
        config.targets.gpu_backend = convert_gpu_backend(backend);
    }

    // Workers
    if let Some(threads) = cli.threads {
        config.workers.threads = threads;
    }
    if let Some(ref s) = cli.numa_zones {
        config.workers.numa_zones = parse_id_list(s)?;
    }

    // Runtime
    if let Some(ref s) = cli.phase_time_limit {
        config.runtime.phase_time_limit_secs = Some(parse_duration(s)?);
    }
    if let Some(start) = cli.start_time {
        config.runtime.start_time = Some(start);
    }
    config.runtime.continue_on_error |= cli.continue_on_error;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    const EXAMPLE: &str = r#"
        [workload]
        block_size = 4096
        file_size = 1048576
        io_depth = 16
        aio_engine = "io_uring"
        access = "random_aligned"

        [targets]
        bench_paths = ["/mnt/a", "/mnt/b"]
        num_dirs = 2
        num_files = 100

        [workers]
        threads = 8
        numa_zones = [0, 1]

        [phases]
        create_files = true
        read_files = true
    "#;

    #[test]
    fn test_parse_toml_string() {
        let config = parse_toml_string(EXAMPLE).unwrap();

        assert_eq!(config.workload.block_size, 4096);
        assert_eq!(config.workload.io_depth, 16);
        assert_eq!(config.workload.aio_engine, AsyncEngineKind::IoUring);
        assert_eq!(config.workload.access, AccessPattern::RandomAligned);
        assert_eq!(config.targets.bench_paths.len(), 2);
        assert_eq!(config.workers.numa_zones, vec![0, 1]);
        assert_eq!(
            config.phases.selected(),
            vec![BenchPhase::CreateFiles, BenchPhase::ReadFiles]
        );
        assert!(!config.targets.use_cufile);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = parse_toml_string("").unwrap();
        assert_eq!(config.workers.threads, 1);
        assert_eq!(config.workload.io_depth, 1);
    }

    #[test]
    fn test_cli_overrides_toml() {
        let config = parse_toml_string(EXAMPLE).unwrap();
        let cli = Cli::try_parse_from(["phasebench", "-F", "-t", "2", "-b", "8k", "--timelimit", "2m", "/x"])
            .unwrap();

        let merged = merge_cli_with_config(&cli, config).unwrap();

        assert_eq!(merged.workers.threads, 2);
        assert_eq!(merged.workload.block_size, 8192);
        assert_eq!(merged.workload.io_depth, 16);
        assert_eq!(merged.targets.bench_paths, vec![std::path::PathBuf::from("/x")]);
        assert_eq!(merged.phases.selected(), vec![BenchPhase::DeleteFiles]);
        assert_eq!(merged.runtime.phase_time_limit_secs, Some(120));
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let err = parse_toml_string("[workload]\naio_engine = \"posix\"").unwrap_err();
        assert!(format!("{:#}", err).contains("TOML"));
    }
}
