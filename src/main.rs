//! phasebench CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use phasebench::config::cli::Cli;
use phasebench::config::{toml, validator, Config};
use phasebench::coordinator::{self, Coordinator};
use phasebench::output;
use phasebench::target::BenchTargets;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// -v info, -vv debug, -vvv trace; RUST_LOG overrides
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("phasebench={}", level)));

    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn run(cli: Cli) -> Result<i32> {
    let base_config = match cli.config {
        Some(ref path) => toml::parse_toml_file(path)?,
        None => Config::default(),
    };
    let config = toml::merge_cli_with_config(&cli, base_config)?;

    validator::validate_config(&config).context("Configuration validation failed")?;

    let targets = BenchTargets::prepare(
        &config.targets.bench_paths,
        config.workload.file_size,
        config.workload.direct_io,
        config.workload.truncate,
    )?;

    validator::validate_for_path_type(&config, targets.path_type(), targets.file_size())
        .context("Configuration validation failed")?;

    tracing::info!("{}", config);

    coordinator::install_signal_handlers()?;

    let outcome = Coordinator::new(Arc::new(config), Arc::new(targets)).run()?;

    if cli.json {
        println!("{}", output::json::format_run_report(&outcome)?);
    } else {
        output::text::print_phase_summaries(&outcome.summaries);
        if let Some(reason) = outcome.aborted {
            eprintln!("{}", reason);
        }
    }

    Ok(outcome.exit_code())
}
