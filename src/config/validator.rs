//! Configuration validation
//!
//! [`validate_config`] checks everything that can be decided from the
//! configuration alone. [`validate_for_path_type`] runs after the bench paths
//! were inspected and checks the rules that depend on dir vs. file mode.

use super::*;
use crate::target::BenchPathType;
use anyhow::Result;

/// Upper bound for io_depth
pub const MAX_IO_DEPTH: usize = 1024;

pub fn validate_config(config: &Config) -> Result<()> {
    validate_phases(&config.phases)?;
    validate_targets(&config.targets)?;
    validate_workers(&config.workers)?;
    validate_workload(&config.workload, &config.phases)?;
    validate_gpu(config)?;

    Ok(())
}

fn validate_phases(phases: &PhaseSelection) -> Result<()> {
    if phases.is_empty() {
        anyhow::bail!("No benchmark phase selected");
    }
    Ok(())
}

fn validate_targets(targets: &TargetsConfig) -> Result<()> {
    if targets.bench_paths.is_empty() {
        anyhow::bail!("No bench paths given");
    }
    Ok(())
}

fn validate_workers(workers: &WorkerConfig) -> Result<()> {
    if workers.threads == 0 {
        anyhow::bail!("Number of threads must be at least 1");
    }
    Ok(())
}

pub fn validate_workload(workload: &WorkloadConfig, phases: &PhaseSelection) -> Result<()> {
    if workload.io_depth == 0 || workload.io_depth > MAX_IO_DEPTH {
        anyhow::bail!(
            "io_depth must be between 1 and {}, got {}",
            MAX_IO_DEPTH,
            workload.io_depth
        );
    }

    if phases.has_data_phase() && workload.block_size == 0 {
        anyhow::bail!("Block size must not be 0 for create/read phases");
    }

    if workload.access.is_random() {
        if let Some(amount) = workload.random_amount {
            if amount < workload.block_size {
                anyhow::bail!(
                    "Random amount must be at least one block. Random amount: {}; Block size: {}",
                    amount,
                    workload.block_size
                );
            }
        }
    }

    if workload.direct_io && workload.block_size % 512 != 0 {
        tracing::warn!(
            "Block size {} is not a multiple of 512, direct IO will likely fail",
            workload.block_size
        );
    }

    Ok(())
}

fn validate_gpu(config: &Config) -> Result<()> {
    let targets = &config.targets;

    if targets.use_cufile && targets.gpu_ids.is_empty() {
        anyhow::bail!("cuFile API requested, but no GPU IDs given");
    }

    if targets.use_cufile && config.workload.io_depth > 1 {
        anyhow::bail!("cuFile API can't be combined with io_depth > 1");
    }

    Ok(())
}

/// Rules that depend on the detected bench path type
pub fn validate_for_path_type(config: &Config, path_type: BenchPathType, file_size: u64) -> Result<()> {
    match path_type {
        BenchPathType::Dir => Ok(()),
        BenchPathType::File | BenchPathType::BlockDev => {
            if config.phases.has_dir_phase() {
                anyhow::bail!("Directory phases need directories as bench paths, got {}s", path_type);
            }

            let min_size = config.workload.block_size * config.workers.threads as u64;
            if config.phases.has_data_phase() && file_size < min_size {
                anyhow::bail!(
                    "File size must be at least one block per thread in {} mode. \
                     File size: {}; Block size: {}; Threads: {}",
                    path_type,
                    file_size,
                    config.workload.block_size,
                    config.workers.threads
                );
            }

            if config.phases.delete_files && config.workers.threads > 1 && !config.targets.ignore_del_errors {
                tracing::warn!(
                    "All workers delete every bench file in file mode. Expect errors for missing files \
                     unless delete errors are ignored"
                );
            }

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.targets.bench_paths = vec![PathBuf::from("/tmp/bench")];
        config.phases.create_files = true;
        config.workload.block_size = 4096;
        config.workload.file_size = 1 << 20;
        config
    }

    #[test]
    fn test_valid_config_passes() {
        validate_config(&valid_config()).unwrap();
    }

    #[test]
    fn test_zero_threads_rejected() {
        let mut config = valid_config();
        config.workers.threads = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_io_depth_bounds() {
        let mut config = valid_config();
        config.workload.io_depth = 0;
        assert!(validate_config(&config).is_err());
        config.workload.io_depth = 1025;
        assert!(validate_config(&config).is_err());
        config.workload.io_depth = 1024;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_block_size_only_matters_for_data_phases() {
        let mut config = valid_config();
        config.workload.block_size = 0;
        assert!(validate_config(&config).is_err());

        config.phases = PhaseSelection {
            create_dirs: true,
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_cufile_rules() {
        let mut config = valid_config();
        config.targets.use_cufile = true;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("no GPU IDs"));

        config.targets.gpu_ids = vec![0];
        config.workload.io_depth = 4;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("io_depth"));

        config.workload.io_depth = 1;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_random_amount_below_block_rejected() {
        let mut config = valid_config();
        config.workload.access = AccessPattern::RandomAligned;
        config.workload.random_amount = Some(100);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_no_phase_rejected() {
        let mut config = valid_config();
        config.phases = PhaseSelection::default();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_file_mode_needs_block_per_thread() {
        let mut config = valid_config();
        config.workers.threads = 4;

        assert!(validate_for_path_type(&config, BenchPathType::File, 3 * 4096).is_err());
        assert!(validate_for_path_type(&config, BenchPathType::File, 4 * 4096).is_ok());
        assert!(validate_for_path_type(&config, BenchPathType::Dir, 0).is_ok());
    }

    #[test]
    fn test_dir_phase_in_file_mode_rejected() {
        let mut config = valid_config();
        config.phases.create_dirs = true;
        assert!(validate_for_path_type(&config, BenchPathType::BlockDev, 1 << 20).is_err());
    }
}
