//! Release command: thin CLI layer over `cfrelease_core::storage`.

use anyhow::{Context, bail};
use clap::Args;
use inquire::Confirm;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use cfrelease_core::config::Config;
use cfrelease_core::infobase::UpdateReport;
use cfrelease_core::preflight;
use cfrelease_core::storage::{ReleaseOutcome, Storage};
use cfrelease_core::version::BumpLevel;

use super::StepProgress;

/// Arguments for the `release` subcommand.
#[derive(Args, Debug, Default)]
pub struct ReleaseArgs {
    /// Start the next release (bump the third component) instead of a nightly build
    #[arg(long)]
    pub next_release: bool,

    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Skip readiness checks
    #[arg(long)]
    pub no_preflight: bool,

    /// Apply the new update file to every configured infobase afterwards
    #[arg(long)]
    pub apply: bool,
}

#[derive(Serialize)]
struct ReleaseSummary {
    #[serde(flatten)]
    outcome: ReleaseOutcome,
    applied: Vec<UpdateReport>,
}

/// Execute the release command.
#[instrument(name = "cmd_release", skip_all)]
pub fn cmd_release(
    args: ReleaseArgs,
    global_json: bool,
    config: &Config,
    cwd: &camino::Utf8Path,
) -> anyhow::Result<()> {
    debug!(
        json_output = global_json,
        next_release = args.next_release,
        "executing release command"
    );

    let settings = super::storage_settings(config, cwd)?;
    let level = BumpLevel::from_release(args.next_release);

    if args.no_preflight {
        debug!("preflight skipped");
    } else {
        let report = preflight::run_preflight(&settings);
        if !report.all_passed {
            if !global_json {
                println!("{}", "Preflight Checks".bold().underline());
                super::print_checks(&report);
                println!();
            }
            bail!("preflight checks failed (use --no-preflight to skip)");
        }
    }

    let mut storage = Storage::from_settings(&settings);
    let platform = storage.runner();
    debug!(
        platform = platform.name(),
        exe = %platform.exe_path(),
        invocation = platform.invocation().as_str(),
        "platform client bound"
    );

    if !global_json {
        println!(
            "\n{}: {} {} ({})",
            "Release".bold(),
            settings.config_name.green().bold(),
            level.to_string().cyan(),
            settings.repo_path.dimmed(),
        );
        println!(
            "  {} {}",
            platform.exe_path().dimmed(),
            format!("[{}]", platform.invocation().as_str()).dimmed(),
        );
        println!();
    }

    let interactive = std::io::IsTerminal::is_terminal(&std::io::stdin());
    let confirm = config.confirm.unwrap_or(true);
    if confirm && !args.yes && !global_json && interactive {
        let confirmed = Confirm::new("Lock the repository and release?")
            .with_default(true)
            .prompt()
            .context("confirmation prompt failed")?;
        if !confirmed {
            println!("{}", "Release cancelled.".yellow());
            return Ok(());
        }
        println!();
    }

    let mut progress = StepProgress::default();
    let result = storage.make_new_version(level, |event| {
        if !global_json {
            progress.handle(event);
        }
    });

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            if err.lock_held && !global_json {
                println!(
                    "\n  {} {}",
                    "!".yellow().bold(),
                    "The configuration root is still locked in the repository.".yellow()
                );
            }
            return Err(err).context("release failed");
        }
    };

    let applied = if args.apply {
        apply_update(config, &outcome, global_json)?
    } else {
        Vec::new()
    };
    let failed_updates = applied.iter().filter(|r| !r.success()).count();

    if global_json {
        let summary = ReleaseSummary { outcome, applied };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!();
        println!(
            "{} Released {} {}",
            "✓".green().bold(),
            outcome.version.green().bold(),
            format!("(was {})", outcome.previous_version.as_deref().unwrap_or("unknown")).dimmed(),
        );
        println!("  {}: {}", "Copied to".dimmed(), outcome.copied_to.cyan());
    }

    if failed_updates > 0 {
        bail!("update failed for {failed_updates} infobase(s)");
    }
    Ok(())
}

fn apply_update(config: &Config, outcome: &ReleaseOutcome, global_json: bool) -> anyhow::Result<Vec<UpdateReport>> {
    if config.bases.is_empty() {
        warn!("--apply given but no [[bases]] are configured");
        return Ok(Vec::new());
    }

    let platform = super::infobase_platform(config)?;
    if !global_json {
        println!();
        println!("{}", "Applying update".bold().underline());
    }
    super::apply::apply_to_bases(&platform, config.bases.iter().collect(), &outcome.cfu_file, global_json)
}
