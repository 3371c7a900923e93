//! External tool invoker.
//!
//! The platform client is a black box started once per operation, either in
//! designer mode (configuration maintenance) or enterprise mode (runtime).
//! Connection parameters are opaque tokens such as `/s srv01\erp` that are
//! passed through as given.
//!
//! Two invocation strategies exist and one is fixed when the [`Platform`]
//! is built:
//!
//! - [`Invocation::ArgumentVector`] spawns the executable directly with
//!   `[mode, *connection_args, *extra_args]`.
//! - [`Invocation::ShellString`] joins everything into one command line and
//!   hands it to the system shell.

use std::fmt;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from starting the platform client.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// The executable (or the shell) could not be spawned.
    #[error("failed to launch {exe}: {source}")]
    Launch {
        /// The program that failed to start.
        exe: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Result alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Mode the platform client runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Configuration maintenance mode.
    Designer,
    /// Runtime mode.
    Enterprise,
}

impl RunMode {
    /// The mode keyword passed as the first argument.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Designer => "DESIGNER",
            Self::Enterprise => "ENTERPRISE",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the client process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Invocation {
    /// Spawn the executable with an argument vector.
    #[default]
    ArgumentVector,
    /// Build one command line and run it through the system shell.
    ShellString,
}

impl Invocation {
    /// Pick the strategy from the `shell_mode` configuration flag.
    pub const fn from_shell_mode(shell_mode: bool) -> Self {
        if shell_mode {
            Self::ShellString
        } else {
            Self::ArgumentVector
        }
    }

    /// Short label used in command output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ArgumentVector => "argv",
            Self::ShellString => "shell",
        }
    }
}

/// What a finished client process reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, or `-1` when the process was terminated by a signal.
    pub code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock time the process ran.
    pub elapsed: Duration,
}

impl ExitOutcome {
    /// Whether the client exited with code zero.
    pub const fn success(&self) -> bool {
        self.code == 0
    }

    fn from_output(output: &Output, elapsed: Duration) -> Self {
        Self {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed,
        }
    }
}

/// Something that can run the platform client.
///
/// [`Platform`] is the real implementation; tests drive the pipeline with
/// scripted runners.
pub trait ToolRunner {
    /// Run the client once in `mode` and wait for it to exit.
    fn run(
        &self,
        mode: RunMode,
        connection_args: &[String],
        extra_args: &[String],
    ) -> PlatformResult<ExitOutcome>;

    /// Run the client in designer mode.
    fn designer(
        &self,
        connection_args: &[String],
        extra_args: &[String],
    ) -> PlatformResult<ExitOutcome> {
        self.run(RunMode::Designer, connection_args, extra_args)
    }

    /// Run the client in enterprise mode.
    fn enterprise(
        &self,
        connection_args: &[String],
        extra_args: &[String],
    ) -> PlatformResult<ExitOutcome> {
        self.run(RunMode::Enterprise, connection_args, extra_args)
    }
}

/// A platform client binding.
#[derive(Debug, Clone)]
pub struct Platform {
    name: String,
    exe_path: Utf8PathBuf,
    invocation: Invocation,
    verbose: bool,
}

impl Platform {
    /// Bind a client executable under a short name.
    pub fn new(name: impl Into<String>, exe_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            name: name.into(),
            exe_path: exe_path.into(),
            invocation: Invocation::default(),
            verbose: false,
        }
    }

    /// Choose the invocation strategy.
    #[must_use]
    pub const fn with_invocation(mut self, invocation: Invocation) -> Self {
        self.invocation = invocation;
        self
    }

    /// Report every invocation at info level instead of debug.
    #[must_use]
    pub const fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Short name of this binding.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path to the client executable.
    pub fn exe_path(&self) -> &Utf8Path {
        &self.exe_path
    }

    /// The invocation strategy in use.
    pub const fn invocation(&self) -> Invocation {
        self.invocation
    }

    fn command(&self, mode: RunMode, connection_args: &[String], extra_args: &[String]) -> (Command, String) {
        match self.invocation {
            Invocation::ArgumentVector => {
                let argv = argument_vector(mode, connection_args, extra_args);
                let cmdline = format!("{} {}", self.exe_path, argv.join(" "));
                let mut cmd = Command::new(self.exe_path.as_std_path());
                cmd.args(&argv);
                (cmd, cmdline)
            }
            Invocation::ShellString => {
                let line = shell_line(&self.exe_path, mode, connection_args, extra_args);
                (shell_command(&line), line)
            }
        }
    }
}

impl ToolRunner for Platform {
    #[instrument(skip(self, connection_args, extra_args), fields(platform = %self.name))]
    fn run(
        &self,
        mode: RunMode,
        connection_args: &[String],
        extra_args: &[String],
    ) -> PlatformResult<ExitOutcome> {
        let (mut cmd, cmdline) = self.command(mode, connection_args, extra_args);
        debug!(command = %cmdline, "starting platform client");

        let start = Instant::now();
        let output = cmd.output().map_err(|source| PlatformError::Launch {
            exe: self.exe_path.to_string(),
            source,
        })?;
        let outcome = ExitOutcome::from_output(&output, start.elapsed());

        if self.verbose {
            info!(
                command = %cmdline,
                code = outcome.code,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                stdout = %outcome.stdout.trim(),
                stderr = %outcome.stderr.trim(),
                "platform client finished"
            );
        } else {
            debug!(
                code = outcome.code,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "platform client finished"
            );
        }

        Ok(outcome)
    }
}

/// Arguments after the executable for argument-vector invocation.
pub fn argument_vector(mode: RunMode, connection_args: &[String], extra_args: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(1 + connection_args.len() + extra_args.len());
    argv.push(mode.as_str().to_string());
    argv.extend(connection_args.iter().cloned());
    argv.extend(extra_args.iter().cloned());
    argv
}

/// The single command line used for shell-string invocation.
pub fn shell_line(
    exe_path: &Utf8Path,
    mode: RunMode,
    connection_args: &[String],
    extra_args: &[String],
) -> String {
    format!(
        "\"{exe_path}\" {mode} {} {}",
        connection_args.join(" "),
        extra_args.join(" ")
    )
}

/// `cmd /S /C` strips exactly one pair of outer quotes, so the line is
/// wrapped once more and passed raw to keep the quoted executable intact.
#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    use std::os::windows::process::CommandExt;

    let mut cmd = Command::new("cmd");
    cmd.args(["/S", "/C"]).raw_arg(format!("\"{line}\""));
    cmd
}

#[cfg(not(windows))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn argument_vector_orders_mode_connection_extra() {
        let argv = argument_vector(
            RunMode::Designer,
            &strings(&["/s srv/ib", "/N admin"]),
            &strings(&["/UpdateDBCfg"]),
        );
        assert_eq!(argv, strings(&["DESIGNER", "/s srv/ib", "/N admin", "/UpdateDBCfg"]));
    }

    #[test]
    fn shell_line_quotes_executable_and_joins_groups() {
        let line = shell_line(
            Utf8Path::new("/opt/platform/client"),
            RunMode::Enterprise,
            &strings(&["/s srv/ib", "/N admin"]),
            &strings(&["-Dynamic+"]),
        );
        assert_eq!(line, "\"/opt/platform/client\" ENTERPRISE /s srv/ib /N admin -Dynamic+");
    }

    #[test]
    fn invocation_from_shell_mode() {
        assert_eq!(Invocation::from_shell_mode(true), Invocation::ShellString);
        assert_eq!(Invocation::from_shell_mode(false), Invocation::ArgumentVector);
    }

    #[test]
    fn missing_executable_is_a_launch_error() {
        let platform = Platform::new("test", "/nonexistent/cfrelease/platform-client");
        let err = platform.designer(&[], &[]).unwrap_err();
        assert!(matches!(err, PlatformError::Launch { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_is_reported_not_raised() {
        let ok = Platform::new("true", "true").designer(&[], &[]).unwrap();
        assert!(ok.success());

        let failed = Platform::new("false", "false").designer(&[], &[]).unwrap();
        assert_eq!(failed.code, 1);
        assert!(!failed.success());
    }

    #[test]
    fn accessors_report_binding() {
        let platform = Platform::new("nightly", "/opt/platform/client").with_invocation(Invocation::ShellString);
        assert_eq!(platform.name(), "nightly");
        assert_eq!(platform.exe_path(), Utf8Path::new("/opt/platform/client"));
        assert_eq!(platform.invocation(), Invocation::ShellString);
        assert_eq!(platform.invocation().as_str(), "shell");
        assert_eq!(Invocation::ArgumentVector.as_str(), "argv");
    }

    #[cfg(unix)]
    #[test]
    fn verbose_run_logs_command_line() {
        use std::io::Write;
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct Captured(Arc<Mutex<Vec<u8>>>);

        impl Write for Captured {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || writer.clone())
            .finish();

        let outcome = tracing::subscriber::with_default(subscriber, || {
            Platform::new("true", "true")
                .with_verbose(true)
                .designer(&strings(&["/s srv"]), &[])
                .unwrap()
        });
        assert!(outcome.success());

        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("command=true DESIGNER /s srv"), "{logged}");
        assert!(logged.contains("platform client finished"), "{logged}");
    }

    #[cfg(windows)]
    #[test]
    fn shell_string_wraps_line_for_cmd() {
        let platform = Platform::new("client", r"C:\Program Files\platform\client.exe")
            .with_invocation(Invocation::ShellString);
        let (cmd, line) = platform.command(RunMode::Designer, &strings(&["/s srv"]), &strings(&["/Out \"log.txt\""]));

        assert_eq!(line, r#""C:\Program Files\platform\client.exe" DESIGNER /s srv /Out "log.txt""#);
        assert_eq!(cmd.get_program(), "cmd");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["/S".to_string(), "/C".to_string(), format!("\"{line}\"")]);
    }

    #[cfg(unix)]
    #[test]
    fn shell_string_runs_through_shell() {
        let platform = Platform::new("echo", "echo").with_invocation(Invocation::ShellString);
        let outcome = platform
            .enterprise(&strings(&["/s", "srv"]), &strings(&["done"]))
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "ENTERPRISE /s srv done");
    }
}
