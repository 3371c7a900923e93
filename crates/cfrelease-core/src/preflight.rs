//! Preflight checks for release readiness.
//!
//! Validates that the platform client can be started and that the work,
//! build and share directories are in place before a release touches the
//! repository. Returns structured results that the CLI formats.

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::StorageSettings;
use crate::storage::WorkLayout;

/// A single preflight check result.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Human-readable name of the check.
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Description of the result (reason for failure, or confirmation).
    pub message: String,
}

/// Full preflight report.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    /// Individual check results.
    pub checks: Vec<CheckResult>,
    /// Whether all checks passed.
    pub all_passed: bool,
}

/// Run all preflight checks.
///
/// Every check runs even when an earlier one fails so the report lists all
/// problems at once.
#[instrument(skip(settings), fields(work_dir = %settings.work_dir))]
pub fn run_preflight(settings: &StorageSettings) -> PreflightReport {
    let layout = WorkLayout::new(&settings.work_dir);

    let checks = vec![
        check_platform(&settings.platform_exe),
        check_dir("Work directory", &layout.work_dir),
        check_file("Repository objects", &layout.objects_file),
        check_dir("Build directory", &settings.build_path),
        check_dir("Network share", &settings.net_path),
    ];

    let all_passed = checks.iter().all(|c| c.passed);
    debug!(all_passed, check_count = checks.len(), "preflight complete");

    PreflightReport { checks, all_passed }
}

/// The client is either a path to an existing file or a bare name on `PATH`.
fn check_platform(exe: &Utf8Path) -> CheckResult {
    let bare = exe.components().count() == 1;
    let found = if bare {
        which::which(exe.as_str()).ok().and_then(|p| p.to_str().map(str::to_string))
    } else {
        exe.is_file().then(|| exe.to_string())
    };

    match found {
        Some(path) => CheckResult {
            name: "Platform client".into(),
            passed: true,
            message: format!("Found {path}"),
        },
        None if bare => CheckResult {
            name: "Platform client".into(),
            passed: false,
            message: format!("{exe} not found on PATH"),
        },
        None => CheckResult {
            name: "Platform client".into(),
            passed: false,
            message: format!("{exe} does not exist"),
        },
    }
}

fn check_dir(name: &str, path: &Utf8Path) -> CheckResult {
    let passed = path.is_dir();
    CheckResult {
        name: name.into(),
        passed,
        message: if passed {
            format!("{path} exists")
        } else {
            format!("{path} is not a directory")
        },
    }
}

fn check_file(name: &str, path: &Utf8Path) -> CheckResult {
    let passed = path.is_file();
    CheckResult {
        name: name.into(),
        passed,
        message: if passed {
            format!("{path} exists")
        } else {
            format!("{path} is missing")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn settings(root: &Utf8Path, exe: &str) -> StorageSettings {
        StorageSettings {
            platform_exe: exe.into(),
            build_path: root.join("build"),
            net_path: root.join("net"),
            prev_amount_cf: 1,
            ib_server: "srv".into(),
            ib_user: "user".into(),
            ib_password: None,
            repo_path: "repo".into(),
            repo_user: "night".into(),
            repo_password: String::new(),
            config_name: "Erp".into(),
            work_dir: root.join("work"),
            shell_mode: false,
            verbose: false,
        }
    }

    #[test]
    fn preflight_report_serializes() {
        let report = PreflightReport {
            checks: vec![CheckResult {
                name: "test".into(),
                passed: true,
                message: "ok".into(),
            }],
            all_passed: true,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"all_passed\":true"));
    }

    #[test]
    fn empty_root_fails_every_check() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let exe = root.join("missing-client");

        let report = run_preflight(&settings(&root, exe.as_str()));

        assert!(!report.all_passed);
        assert_eq!(report.checks.len(), 5);
        assert!(report.checks.iter().all(|c| !c.passed));
    }

    #[test]
    fn prepared_root_passes() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        for dir in ["build", "net", "work"] {
            std::fs::create_dir(root.join(dir)).unwrap();
        }
        std::fs::write(root.join("work").join("config_objects.xml"), "<Objects/>").unwrap();
        let exe = root.join("client");
        std::fs::write(&exe, "").unwrap();

        let report = run_preflight(&settings(&root, exe.as_str()));

        assert!(report.all_passed, "{:?}", report.checks);
    }

    #[test]
    fn bare_name_missing_from_path() {
        let result = check_platform(Utf8Path::new("cfrelease-no-such-platform-client"));
        assert!(!result.passed);
        assert!(result.message.contains("PATH"));
    }
}
