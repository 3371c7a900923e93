//! Apply command: push an update file to configured infobases.

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use cfrelease_core::config::{BaseConfig, Config};
use cfrelease_core::infobase::{InfoBase, UpdateReport};
use cfrelease_core::platform::ToolRunner;

/// Arguments for the `apply` subcommand.
#[derive(Args, Debug, Default)]
pub struct ApplyArgs {
    /// Update file to apply (default: the build of --version, if given)
    #[arg(long, value_name = "FILE", required_unless_present = "version")]
    pub cfu: Option<Utf8PathBuf>,

    /// Apply the update file built for this version
    #[arg(long, value_name = "VERSION", conflicts_with = "cfu")]
    pub version: Option<String>,

    /// Only update the named infobase (repeatable)
    #[arg(long = "base", value_name = "NAME")]
    pub bases: Vec<String>,
}

/// Execute the apply command.
#[instrument(name = "cmd_apply", skip_all)]
pub fn cmd_apply(
    args: ApplyArgs,
    global_json: bool,
    config: &Config,
    cwd: &Utf8Path,
) -> anyhow::Result<()> {
    debug!(json_output = global_json, bases = ?args.bases, "executing apply command");

    let cfu = match (args.cfu, args.version) {
        (Some(cfu), _) => cwd.join(cfu),
        (None, Some(version)) => {
            let settings = super::storage_settings(config, cwd)?;
            cfrelease_core::artifacts::artifact_paths(&settings.build_path, &version).cfu
        }
        (None, None) => bail!("either --cfu or --version is required"),
    };

    let selected = select_bases(&config.bases, &args.bases)?;
    let platform = super::infobase_platform(config)?;
    let reports = apply_to_bases(&platform, selected, &cfu, global_json)?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    let failed = reports.iter().filter(|r| !r.success()).count();
    if failed > 0 {
        bail!("update failed for {failed} infobase(s)");
    }
    Ok(())
}

/// Pick the configured bases named on the command line (all when none are named).
fn select_bases<'a>(bases: &'a [BaseConfig], names: &[String]) -> anyhow::Result<Vec<&'a BaseConfig>> {
    if bases.is_empty() {
        bail!("no [[bases]] are configured");
    }
    if names.is_empty() {
        return Ok(bases.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            bases
                .iter()
                .find(|b| &b.name == name)
                .with_context(|| format!("no configured infobase named {name}"))
        })
        .collect()
}

/// Update each base in turn and print one line per base.
///
/// A base whose runs exit non-zero does not stop the others.
pub fn apply_to_bases(
    runner: &impl ToolRunner,
    bases: Vec<&BaseConfig>,
    cfu: &Utf8Path,
    global_json: bool,
) -> anyhow::Result<Vec<UpdateReport>> {
    let mut reports = Vec::with_capacity(bases.len());
    for base in bases {
        let report = InfoBase::from(base)
            .update(runner, cfu)
            .with_context(|| format!("failed to update {}", base.name))?;
        if !global_json {
            let icon = if report.success() {
                "✓".green().to_string()
            } else {
                "✗".red().to_string()
            };
            println!(
                "  {icon} {} {}",
                report.base.bold(),
                format!(
                    "designer: {}, enterprise: {}",
                    report.designer_code, report.enterprise_code
                )
                .dimmed(),
            );
        }
        reports.push(report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(name: &str) -> BaseConfig {
        BaseConfig {
            name: name.into(),
            server: format!("srv/{name}"),
            user: "admin".into(),
            password: None,
        }
    }

    #[test]
    fn select_all_when_no_names() {
        let bases = [base("test"), base("demo")];
        assert_eq!(select_bases(&bases, &[]).unwrap().len(), 2);
    }

    #[test]
    fn select_named_bases() {
        let bases = [base("test"), base("demo")];
        let picked = select_bases(&bases, &["demo".to_string()]).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "demo");
    }

    #[test]
    fn unknown_name_is_an_error() {
        let bases = [base("test")];
        let err = select_bases(&bases, &["prod".to_string()]).unwrap_err();
        assert!(err.to_string().contains("prod"));
    }

    #[test]
    fn no_bases_is_an_error() {
        assert!(select_bases(&[], &[]).is_err());
    }
}
