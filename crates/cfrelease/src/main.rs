//! cfrelease CLI
#![deny(unsafe_code)]

use std::process::ExitCode;

use anyhow::Context;
use cfrelease::{Cli, Commands, commands};
use cfrelease_core::config::ConfigLoader;
use cfrelease_core::storage::{ReleaseError, StepError};
use clap::Parser;
use tracing::debug;

mod observability;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.color.apply();

    if let Some(ref dir) = cli.chdir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("failed to change directory to {}", dir.display()))?;
    }

    let cwd = std::env::current_dir().context("failed to determine current directory")?;
    let cwd = camino::Utf8PathBuf::try_from(cwd).map_err(|e| {
        anyhow::anyhow!(
            "current directory is not valid UTF-8: {}",
            e.into_path_buf().display()
        )
    })?;
    let mut loader = ConfigLoader::new().with_project_search(&cwd);
    if let Some(ref config_path) = cli.config {
        let config_path = camino::Utf8PathBuf::try_from(config_path.clone()).map_err(|e| {
            anyhow::anyhow!(
                "config path is not valid UTF-8: {}",
                e.into_path_buf().display()
            )
        })?;
        loader = loader.with_file(&config_path);
    }
    let config = loader.load().context("failed to load configuration")?;

    let obs_config =
        observability::ObservabilityConfig::new(config.log_dir.clone(), Some(cwd.clone()));
    let env_filter = observability::env_filter(cli.quiet, cli.verbose, config.log_level.as_str());
    let _guard = observability::init_observability(&obs_config, env_filter)
        .context("failed to initialize logging")?;

    debug!(
        verbose = cli.verbose,
        quiet = cli.quiet,
        json = cli.json,
        color = ?cli.color,
        chdir = ?cli.chdir,
        "CLI initialized"
    );

    let result = match cli.command {
        Commands::Release(args) => commands::release::cmd_release(args, cli.json, &config, &cwd),
        Commands::Step(args) => commands::step::cmd_step(args, cli.json, &config, &cwd),
        Commands::Apply(args) => commands::apply::cmd_apply(args, cli.json, &config, &cwd),
        Commands::Preflight(args) => commands::preflight::cmd_preflight(args, cli.json, &config, &cwd),
        Commands::Doctor(args) => commands::doctor::cmd_doctor(args, cli.json, &config, &cwd),
    };
    if let Err(ref err) = result {
        tracing::error!(error = %err, "fatal error");
    }
    result
}

/// Map a pipeline failure anywhere in the error chain to its exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    let code = err.chain().find_map(|cause| {
        cause
            .downcast_ref::<ReleaseError>()
            .map(ReleaseError::exit_code)
            .or_else(|| cause.downcast_ref::<StepError>().map(StepError::code))
    });
    code.and_then(|c| u8::try_from(c).ok())
        .filter(|c| *c != 0)
        .unwrap_or(1)
}
