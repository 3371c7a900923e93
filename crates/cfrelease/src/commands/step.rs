//! Step command: run one release step on its own.

use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument};

use cfrelease_core::config::Config;
use cfrelease_core::storage::{ReleaseEvent, Step, StepReport, Storage};
use cfrelease_core::version::BumpLevel;

use super::StepProgress;

/// Arguments for the `step` subcommand.
#[derive(Args, Debug)]
pub struct StepArgs {
    /// Step to run
    #[arg(value_enum)]
    pub step: Step,

    /// Version produced by an earlier upgrade (needed by commit, build and copy)
    #[arg(long, value_name = "VERSION")]
    pub version: Option<String>,

    /// Bump for the next release instead of a nightly build (upgrade only)
    #[arg(long)]
    pub next_release: bool,
}

#[derive(Serialize)]
struct StepSummary {
    step: Step,
    #[serde(flatten)]
    report: StepReport,
    new_version: Option<String>,
}

/// Execute the step command.
#[instrument(name = "cmd_step", skip_all, fields(step = %args.step))]
pub fn cmd_step(
    args: StepArgs,
    global_json: bool,
    config: &Config,
    cwd: &camino::Utf8Path,
) -> anyhow::Result<()> {
    debug!(json_output = global_json, version = ?args.version, "executing step command");

    let settings = super::storage_settings(config, cwd)?;
    let mut storage = Storage::from_settings(&settings);
    if let Some(version) = args.version {
        storage = storage.resume(version);
    }

    let mut progress = StepProgress::default();
    let level = BumpLevel::from_release(args.next_release);
    let step = args.step;

    if !global_json {
        progress.handle(ReleaseEvent::StepStarted(step));
    }
    let result = storage.run_step(step, level);
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            if !global_json {
                progress.handle(ReleaseEvent::StepFailed {
                    step,
                    message: err.to_string(),
                    code: err.code(),
                });
            }
            return Err(anyhow::Error::new(err).context(format!("{step} failed")));
        }
    };

    if global_json {
        let summary = StepSummary {
            step,
            report,
            new_version: storage.state().new_version.clone(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        progress.handle(ReleaseEvent::StepCompleted(step, report));
        if step == Step::UpgradeVersion
            && let Some(version) = storage.state().new_version.as_deref()
        {
            println!(
                "\n  {} continue with {}",
                "→".dimmed(),
                format!("cfrelease step load && cfrelease step commit --version {version}").cyan()
            );
        }
    }

    Ok(())
}
