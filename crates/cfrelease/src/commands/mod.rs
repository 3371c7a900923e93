//! Command implementations

pub mod apply;

pub mod doctor;

pub mod preflight;

pub mod release;

pub mod step;

use anyhow::Context;
use camino::Utf8Path;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

use cfrelease_core::config::{Config, StorageSettings};
use cfrelease_core::platform::{Invocation, Platform};
use cfrelease_core::preflight::PreflightReport;
use cfrelease_core::storage::ReleaseEvent;

/// Resolve the `[storage]` section, pointing at `doctor` when it is incomplete.
pub fn storage_settings(config: &Config, cwd: &Utf8Path) -> anyhow::Result<StorageSettings> {
    config
        .storage_settings(cwd)
        .context("release settings are incomplete (run `cfrelease doctor --template` for a starting point)")
}

/// The platform client used for infobase updates.
///
/// Shares the executable and invocation style of the `[storage]` section.
pub fn infobase_platform(config: &Config) -> anyhow::Result<Platform> {
    let storage = config
        .storage
        .as_ref()
        .context("missing [storage] section in configuration")?;
    let exe = storage
        .platform_exe
        .clone()
        .context("missing required storage key: platform_exe")?;
    Ok(Platform::new("infobase", exe)
        .with_invocation(Invocation::from_shell_mode(storage.shell_mode.unwrap_or(false)))
        .with_verbose(config.verbose))
}

/// Terminal progress for pipeline steps: a spinner while a step runs, one
/// line per finished step.
#[derive(Default)]
pub struct StepProgress {
    spinner: Option<ProgressBar>,
}

impl StepProgress {
    /// Update the display for a pipeline event.
    pub fn handle(&mut self, event: ReleaseEvent) {
        match event {
            ReleaseEvent::StepStarted(step) => {
                let spinner = ProgressBar::new_spinner();
                spinner.set_style(
                    ProgressStyle::with_template("  {spinner:.cyan} {msg} {elapsed:.dim}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner())
                        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]),
                );
                spinner.set_message(format!("{step}..."));
                spinner.enable_steady_tick(std::time::Duration::from_millis(80));
                self.spinner = Some(spinner);
            }
            ReleaseEvent::StepCompleted(step, report) => {
                self.clear();
                println!(
                    "  {} {} {} {}",
                    "✓".green(),
                    step.to_string().bold(),
                    report.message.dimmed(),
                    format!("({:.1}s)", report.elapsed_ms as f64 / 1000.0).dimmed(),
                );
            }
            ReleaseEvent::StepFailed { step, message, code } => {
                self.clear();
                println!(
                    "  {} {} {} {}",
                    "✗".red(),
                    step.to_string().bold(),
                    message.red(),
                    format!("(code {code})").dimmed(),
                );
            }
        }
    }

    fn clear(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

/// Print a preflight report as a check list.
pub fn print_checks(report: &PreflightReport) {
    for check in &report.checks {
        let icon = if check.passed {
            "✓".green().to_string()
        } else {
            "✗".red().to_string()
        };
        println!("  {icon} {}: {}", check.name.bold(), check.message);
    }
}
