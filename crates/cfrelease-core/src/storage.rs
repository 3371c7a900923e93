//! Release pipeline orchestrator.
//!
//! A nightly release walks the configuration repository through a fixed
//! sequence of designer runs:
//!
//! 1. update the infobase from the repository
//! 2. dump the configuration to XML files
//! 3. lock the configuration root in the repository
//! 4. bump the version inside the dump
//! 5. load the dump back and commit it to the repository
//! 6. build the distribution files
//! 7. copy them to the network share
//!
//! [`Storage::make_new_version`] runs the whole sequence and stops at the
//! first failure. Loading and committing are the exception: the commit runs
//! even when loading failed, and both failures are reported. Every step is
//! also available on its own so a broken night can be finished by hand.

use std::fmt;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::artifacts::{self, ArtifactPaths};
use crate::config::StorageSettings;
use crate::dump::{self, XmlError};
use crate::platform::{Invocation, Platform, PlatformError, ToolRunner};
use crate::version::BumpLevel;

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// Why a single step failed.
#[derive(Error, Debug)]
pub enum StepError {
    /// The platform client exited with a non-zero code.
    #[error("platform client exited with code {0}")]
    Exit(i32),

    /// The platform client could not be started.
    #[error(transparent)]
    Launch(#[from] PlatformError),

    /// Editing the dumped XML failed.
    #[error(transparent)]
    Xml(#[from] XmlError),

    /// The step needs a new version and none was produced or seeded.
    #[error("no new version is known; run the upgrade step first or pass --version")]
    MissingVersion,

    /// The step needs build artifacts and none were produced or seeded.
    #[error("no build artifacts are known; run the build step first or pass --version")]
    MissingArtifacts,

    /// A filesystem operation failed.
    #[error("failed to {action} {path}: {source}")]
    Io {
        /// What was being done.
        action: &'static str,
        /// Path involved.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

impl StepError {
    /// Process exit code for this failure.
    ///
    /// A client exit code is passed through (a signal-terminated client
    /// counts as `1`); missing state is `2`; everything else is `1`.
    pub const fn code(&self) -> i32 {
        match self {
            Self::Exit(code) if *code > 0 => *code,
            Self::MissingVersion | Self::MissingArtifacts => 2,
            _ => 1,
        }
    }
}

/// A failed step and its error.
#[derive(Debug)]
pub struct StepFailure {
    /// Which step failed.
    pub step: Step,
    /// Why it failed.
    pub error: StepError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.error)
    }
}

/// The release pipeline stopped.
#[derive(Debug)]
pub struct ReleaseError {
    /// Failed steps in execution order. Only loading plus committing can
    /// produce two entries.
    pub failures: Vec<StepFailure>,
    /// The repository lock was taken and not released by a commit.
    pub lock_held: bool,
    /// Steps that finished before the pipeline stopped.
    pub completed: Vec<(Step, StepReport)>,
}

impl ReleaseError {
    /// Sum of the exit codes of all failed steps.
    pub fn exit_code(&self) -> i32 {
        self.failures.iter().map(|f| f.error.code()).sum()
    }

    /// The first step that failed.
    pub fn step(&self) -> Option<Step> {
        self.failures.first().map(|f| f.step)
    }
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "release stopped: ")?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        if self.lock_held {
            write!(f, " (repository lock is still held)")?;
        }
        Ok(())
    }
}

impl std::error::Error for ReleaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|f| &f.error as &(dyn std::error::Error + 'static))
    }
}

// ──────────────────────────────────────────────
// Steps and events
// ──────────────────────────────────────────────

/// Steps of the release pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Update the infobase configuration from the repository.
    #[value(name = "update")]
    UpdateFromRepo,
    /// Dump the configuration to XML files.
    #[value(name = "dump")]
    DumpToFiles,
    /// Lock the configuration root in the repository.
    #[value(name = "lock")]
    LockInRepo,
    /// Bump the version in the dumped files.
    #[value(name = "upgrade")]
    UpgradeVersion,
    /// Load the dumped files back into the infobase.
    #[value(name = "load")]
    LoadFromFiles,
    /// Commit the change to the repository.
    #[value(name = "commit")]
    CommitToRepo,
    /// Create the distribution files.
    #[value(name = "build")]
    MakeBuild,
    /// Copy the distribution files to the network share.
    #[value(name = "copy")]
    CopyReadyFiles,
}

impl Step {
    /// All steps in execution order.
    pub const ALL: [Self; 8] = [
        Self::UpdateFromRepo,
        Self::DumpToFiles,
        Self::LockInRepo,
        Self::UpgradeVersion,
        Self::LoadFromFiles,
        Self::CommitToRepo,
        Self::MakeBuild,
        Self::CopyReadyFiles,
    ];

    /// Whether the pipeline carries on to the next step after this one fails.
    pub const fn continues_on_failure(self) -> bool {
        matches!(self, Self::LoadFromFiles)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdateFromRepo => write!(f, "update_from_repo"),
            Self::DumpToFiles => write!(f, "dump_to_files"),
            Self::LockInRepo => write!(f, "lock_in_repo"),
            Self::UpgradeVersion => write!(f, "upgrade_version"),
            Self::LoadFromFiles => write!(f, "load_from_files"),
            Self::CommitToRepo => write!(f, "commit_to_repo"),
            Self::MakeBuild => write!(f, "make_build"),
            Self::CopyReadyFiles => write!(f, "copy_ready_files"),
        }
    }
}

/// What a finished step reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    /// Short description of what happened.
    pub message: String,
    /// Wall-clock duration of the step in milliseconds.
    pub elapsed_ms: u64,
}

impl StepReport {
    fn finish(start: Instant, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Events emitted during the release pipeline for progress reporting.
#[derive(Debug, Clone)]
pub enum ReleaseEvent {
    /// A step has started.
    StepStarted(Step),
    /// A step finished successfully.
    StepCompleted(Step, StepReport),
    /// A step failed.
    StepFailed {
        /// Which step failed.
        step: Step,
        /// Error description.
        message: String,
        /// Exit code attributed to the failure.
        code: i32,
    },
}

/// Outcome of a full release.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    /// Version before the bump.
    pub previous_version: Option<String>,
    /// The released version.
    pub version: String,
    /// Full configuration artifact.
    pub cf_file: Utf8PathBuf,
    /// Update artifact.
    pub cfu_file: Utf8PathBuf,
    /// Directory on the network share holding the copies.
    pub copied_to: Utf8PathBuf,
    /// Results of each step.
    pub steps: Vec<(Step, StepReport)>,
}

// ──────────────────────────────────────────────
// State
// ──────────────────────────────────────────────

/// Files and directories the pipeline uses inside the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    /// The work directory itself.
    pub work_dir: Utf8PathBuf,
    /// Configuration dump directory.
    pub dump_dir: Utf8PathBuf,
    /// Root file of the dump.
    pub root_config: Utf8PathBuf,
    /// Dump info file.
    pub dump_info: Utf8PathBuf,
    /// Change list written by incremental dumps.
    pub diff_file: Utf8PathBuf,
    /// Repository objects to lock and commit. Must exist beforehand.
    pub objects_file: Utf8PathBuf,
    /// Designer log.
    pub log_file: Utf8PathBuf,
}

impl WorkLayout {
    /// Derive the layout from a work directory.
    pub fn new(work_dir: &Utf8Path) -> Self {
        let dump_dir = work_dir.join("current_config");
        Self {
            work_dir: work_dir.to_path_buf(),
            root_config: dump_dir.join("Configuration.xml"),
            dump_info: dump_dir.join("ConfigDumpInfo.xml"),
            dump_dir,
            diff_file: work_dir.join("diff.txt"),
            objects_file: work_dir.join("config_objects.xml"),
            log_file: work_dir.join("log.txt"),
        }
    }
}

/// What the pipeline has produced so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseState {
    /// Version found before the bump.
    pub previous_version: Option<String>,
    /// Version after the bump.
    pub new_version: Option<String>,
    /// Built full configuration file.
    pub cf_file: Option<Utf8PathBuf>,
    /// Built update file.
    pub cfu_file: Option<Utf8PathBuf>,
    /// Network copy directory.
    pub copied_to: Option<Utf8PathBuf>,
}

// ──────────────────────────────────────────────
// Orchestrator
// ──────────────────────────────────────────────

/// The configuration repository and everything needed to release from it.
#[derive(Debug)]
pub struct Storage<R: ToolRunner = Platform> {
    runner: R,
    layout: WorkLayout,
    build_path: Utf8PathBuf,
    net_path: Utf8PathBuf,
    prev_amount_cf: usize,
    config_name: String,
    connection: Vec<String>,
    log_args: Vec<String>,
    state: ReleaseState,
}

impl Storage<Platform> {
    /// Build an orchestrator that drives the configured platform client.
    pub fn from_settings(settings: &StorageSettings) -> Self {
        let platform = Platform::new("storage", settings.platform_exe.clone())
            .with_invocation(Invocation::from_shell_mode(settings.shell_mode))
            .with_verbose(settings.verbose);
        Self::new(platform, settings)
    }
}

impl<R: ToolRunner> Storage<R> {
    /// Build an orchestrator around any [`ToolRunner`].
    pub fn new(runner: R, settings: &StorageSettings) -> Self {
        let layout = WorkLayout::new(&settings.work_dir);
        let log_args = vec![format!("/Out {}", layout.log_file), "-NoTruncate".to_string()];
        Self {
            runner,
            connection: connection_args(settings),
            log_args,
            layout,
            build_path: settings.build_path.clone(),
            net_path: settings.net_path.clone(),
            prev_amount_cf: settings.prev_amount_cf,
            config_name: settings.config_name.clone(),
            state: ReleaseState::default(),
        }
    }

    /// Continue from an earlier run that produced `version`.
    ///
    /// Seeds the new version and the artifact paths derived from it so that
    /// later steps can run in a separate invocation.
    #[must_use]
    pub fn resume(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        let paths = artifacts::artifact_paths(&self.build_path, &version);
        self.state.cf_file = Some(paths.cf);
        self.state.cfu_file = Some(paths.cfu);
        self.state.new_version = Some(version);
        self
    }

    /// Work directory layout.
    pub const fn layout(&self) -> &WorkLayout {
        &self.layout
    }

    /// What the pipeline has produced so far.
    pub const fn state(&self) -> &ReleaseState {
        &self.state
    }

    /// Connection tokens passed to every designer run.
    pub fn connection_args(&self) -> &[String] {
        &self.connection
    }

    /// The built update file, once known.
    pub fn cfu_path(&self) -> Option<&Utf8Path> {
        self.state.cfu_file.as_deref()
    }

    /// The runner driving the platform client.
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Run the whole release.
    ///
    /// Calls `on_event` at step boundaries so the CLI can update progress
    /// display.
    #[instrument(skip(self, on_event), fields(config = %self.config_name))]
    pub fn make_new_version(
        &mut self,
        level: BumpLevel,
        mut on_event: impl FnMut(ReleaseEvent),
    ) -> Result<ReleaseOutcome, ReleaseError> {
        let mut completed = Vec::new();
        let mut failures = Vec::new();
        let mut lock_held = false;

        for step in Step::ALL {
            match self.observe(step, level, &mut on_event) {
                Ok(report) => {
                    match step {
                        Step::LockInRepo => lock_held = true,
                        Step::CommitToRepo => lock_held = false,
                        _ => {}
                    }
                    completed.push((step, report));
                }
                Err(error) => failures.push(StepFailure { step, error }),
            }

            let stop = !failures.is_empty() && !step.continues_on_failure();
            if stop {
                if lock_held {
                    warn!(%step, "release stopped while the repository lock is held");
                }
                return Err(ReleaseError {
                    failures,
                    lock_held,
                    completed,
                });
            }
        }

        let (Some(version), Some(cf_file), Some(cfu_file), Some(copied_to)) = (
            self.state.new_version.clone(),
            self.state.cf_file.clone(),
            self.state.cfu_file.clone(),
            self.state.copied_to.clone(),
        ) else {
            // Every step succeeded, so the state is populated.
            return Err(ReleaseError {
                failures: vec![StepFailure {
                    step: Step::CopyReadyFiles,
                    error: StepError::MissingArtifacts,
                }],
                lock_held: false,
                completed,
            });
        };

        info!(%version, "release finished");
        Ok(ReleaseOutcome {
            previous_version: self.state.previous_version.clone(),
            version,
            cf_file,
            cfu_file,
            copied_to,
            steps: completed,
        })
    }

    /// Run a single step by name.
    pub fn run_step(&mut self, step: Step, level: BumpLevel) -> Result<StepReport, StepError> {
        match step {
            Step::UpdateFromRepo => self.update_from_repo(),
            Step::DumpToFiles => self.dump_to_files(),
            Step::LockInRepo => self.lock_in_repo(),
            Step::UpgradeVersion => self.upgrade_version(level),
            Step::LoadFromFiles => self.load_from_files(),
            Step::CommitToRepo => self.commit_to_repo(),
            Step::MakeBuild => self.make_build(),
            Step::CopyReadyFiles => self.copy_ready_files(),
        }
    }

    fn observe(
        &mut self,
        step: Step,
        level: BumpLevel,
        on_event: &mut impl FnMut(ReleaseEvent),
    ) -> Result<StepReport, StepError> {
        on_event(ReleaseEvent::StepStarted(step));
        let result = self.run_step(step, level);
        match &result {
            Ok(report) => on_event(ReleaseEvent::StepCompleted(step, report.clone())),
            Err(error) => on_event(ReleaseEvent::StepFailed {
                step,
                message: error.to_string(),
                code: error.code(),
            }),
        }
        result
    }

    /// Update the infobase configuration from the repository.
    #[instrument(skip(self))]
    pub fn update_from_repo(&mut self) -> Result<StepReport, StepError> {
        let start = Instant::now();
        self.designer(vec![
            "/ConfigurationRepositoryUpdateCfg -force".to_string(),
            "/UpdateDBCfg".to_string(),
        ])?;
        Ok(StepReport::finish(start, "infobase updated from repository"))
    }

    /// Dump the configuration to XML files.
    ///
    /// An existing dump is updated incrementally and the change list is
    /// written to `diff.txt`.
    #[instrument(skip(self))]
    pub fn dump_to_files(&mut self) -> Result<StepReport, StepError> {
        let start = Instant::now();
        let mut args = vec![format!("/DumpConfigToFiles {}", self.layout.dump_dir)];
        let incremental = self.layout.dump_dir.exists();
        if incremental {
            debug!("dump directory exists, dumping incrementally");
            args.extend([
                "-update".to_string(),
                "-force".to_string(),
                format!("-getChanges {}", self.layout.diff_file),
            ]);
        }
        self.designer(args)?;
        let message = if incremental {
            format!("configuration dumped to {} (incremental)", self.layout.dump_dir)
        } else {
            format!("configuration dumped to {}", self.layout.dump_dir)
        };
        Ok(StepReport::finish(start, message))
    }

    /// Lock the configuration root in the repository.
    #[instrument(skip(self))]
    pub fn lock_in_repo(&mut self) -> Result<StepReport, StepError> {
        let start = Instant::now();
        self.designer(vec![
            "/ConfigurationRepositoryLock".to_string(),
            format!("-Objects {}", self.layout.objects_file),
        ])?;
        Ok(StepReport::finish(start, "configuration root locked"))
    }

    /// Bump the version in the dumped files.
    ///
    /// The root file is rewritten before the dump info is edited; a failure
    /// in the second file leaves the first one bumped.
    #[instrument(skip(self))]
    pub fn upgrade_version(&mut self, level: BumpLevel) -> Result<StepReport, StepError> {
        let start = Instant::now();
        let change = dump::update_root_version(&self.layout.root_config, level)?;
        self.state.previous_version = Some(change.previous.clone());
        self.state.new_version = Some(change.current.clone());
        dump::flip_config_version(&self.layout.dump_info, &self.config_name)?;
        Ok(StepReport::finish(
            start,
            format!("version {} -> {}", change.previous, change.current),
        ))
    }

    /// Load the dumped files back into the infobase.
    #[instrument(skip(self))]
    pub fn load_from_files(&mut self) -> Result<StepReport, StepError> {
        let start = Instant::now();
        self.designer(vec![
            format!("/LoadConfigFromFiles {}", self.layout.dump_dir),
            format!("-files {}", self.layout.root_config),
            "-Format Hierarchical".to_string(),
            "-updateConfigDumpInfo".to_string(),
            "/UpdateDBCfg".to_string(),
        ])?;
        Ok(StepReport::finish(start, "configuration loaded from files"))
    }

    /// Commit the change to the repository, releasing the lock.
    #[instrument(skip(self))]
    pub fn commit_to_repo(&mut self) -> Result<StepReport, StepError> {
        let start = Instant::now();
        let version = self.new_version()?;
        self.designer(vec![
            "/ConfigurationRepositoryCommit".to_string(),
            format!("-Objects {}", self.layout.objects_file),
            "-comment".to_string(),
            format!("{version} - night build"),
        ])?;
        Ok(StepReport::finish(start, format!("committed {version}")))
    }

    /// Create the distribution files for the new version.
    ///
    /// The update file covers the `prev_amount_cf` most recently modified
    /// release directories.
    #[instrument(skip(self))]
    pub fn make_build(&mut self) -> Result<StepReport, StepError> {
        let start = Instant::now();
        let version = self.new_version()?;

        let candidates =
            artifacts::list_build_candidates(&self.build_path).map_err(|source| StepError::Io {
                action: "list",
                path: self.build_path.clone(),
                source,
            })?;
        let previous = artifacts::select_recent(&candidates, self.prev_amount_cf);
        debug!(
            previous = ?previous.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "update file sources selected"
        );

        self.designer(artifacts::distribution_args(&self.build_path, &version, previous))?;

        let ArtifactPaths { cf, cfu } = artifacts::artifact_paths(&self.build_path, &version);
        self.state.cf_file = Some(cf);
        self.state.cfu_file = Some(cfu);
        Ok(StepReport::finish(
            start,
            format!("built {version} over {} previous release(s)", previous.len()),
        ))
    }

    /// Copy the distribution files to `<net_path>/<version>`.
    #[instrument(skip(self))]
    pub fn copy_ready_files(&mut self) -> Result<StepReport, StepError> {
        let start = Instant::now();
        let version = self.new_version()?;
        let (Some(cf), Some(cfu)) = (self.state.cf_file.clone(), self.state.cfu_file.clone()) else {
            return Err(StepError::MissingArtifacts);
        };

        let target = artifacts::copy_to_share(&ArtifactPaths { cf, cfu }, &self.net_path, &version)
            .map_err(|source| StepError::Io {
                action: "copy artifacts to",
                path: self.net_path.join(&version),
                source,
            })?;
        let message = format!("copied to {target}");
        self.state.copied_to = Some(target);
        Ok(StepReport::finish(start, message))
    }

    fn new_version(&self) -> Result<String, StepError> {
        self.state.new_version.clone().ok_or(StepError::MissingVersion)
    }

    fn designer(&self, mut args: Vec<String>) -> Result<(), StepError> {
        args.extend(self.log_args.iter().cloned());
        let outcome = self.runner.designer(&self.connection, &args)?;
        if outcome.success() {
            Ok(())
        } else {
            Err(StepError::Exit(outcome.code))
        }
    }
}

/// Connection tokens for the repository infobase.
fn connection_args(settings: &StorageSettings) -> Vec<String> {
    let mut args = vec![
        format!("/s {}", settings.ib_server),
        format!("/N {}", settings.ib_user),
    ];
    if let Some(password) = settings.ib_password.as_deref().filter(|p| !p.is_empty()) {
        args.push(format!("/P {password}"));
    }
    args.extend([
        format!("/ConfigurationRepositoryF {}", settings.repo_path),
        format!("/ConfigurationRepositoryN {}", settings.repo_user),
        format!("/ConfigurationRepositoryP {}", settings.repo_password),
    ]);
    args
}
