//! Applying an update file to downstream application instances.
//!
//! After a release, test and demo infobases receive the new `.cfu` file.
//! The update is a designer run that applies the file and restructures the
//! database, followed by one enterprise run that lets the runtime finish
//! any pending data processing.

use camino::Utf8Path;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::BaseConfig;
use crate::platform::{PlatformError, ToolRunner};

/// Errors from updating an infobase.
#[derive(Error, Debug)]
pub enum InfoBaseError {
    /// The platform client could not be started.
    #[error("{base}: {source}")]
    Launch {
        /// Infobase name.
        base: String,
        /// Underlying launch error.
        source: PlatformError,
    },

    /// The update file does not exist.
    #[error("update file {0} does not exist")]
    MissingUpdateFile(String),
}

/// Result alias for infobase operations.
pub type InfoBaseResult<T> = Result<T, InfoBaseError>;

/// An application instance that can receive an update file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoBase {
    /// Short name used in output.
    pub name: String,
    /// Server address.
    pub server: String,
    /// User name.
    pub user: String,
    /// Password, omitted from the connection when unset or empty.
    pub password: Option<String>,
}

/// Exit codes of the two runs of an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    /// Infobase name.
    pub base: String,
    /// Exit code of the designer run.
    pub designer_code: i32,
    /// Exit code of the enterprise run.
    pub enterprise_code: i32,
}

impl UpdateReport {
    /// Whether both runs exited with code zero.
    pub const fn success(&self) -> bool {
        self.designer_code == 0 && self.enterprise_code == 0
    }
}

impl From<&BaseConfig> for InfoBase {
    fn from(config: &BaseConfig) -> Self {
        Self {
            name: config.name.clone(),
            server: config.server.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }
}

impl InfoBase {
    /// Connection tokens for this infobase.
    pub fn connection_args(&self) -> Vec<String> {
        let mut args = vec![format!("/s {}", self.server), format!("/N {}", self.user)];
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            args.push(format!("/P {password}"));
        }
        args
    }

    /// Apply `update_file`.
    ///
    /// Both runs always happen; their exit codes are reported rather than
    /// treated as errors. Only a client that cannot be started is an error.
    #[instrument(skip(self, runner), fields(base = %self.name))]
    pub fn update(&self, runner: &impl ToolRunner, update_file: &Utf8Path) -> InfoBaseResult<UpdateReport> {
        if !update_file.is_file() {
            return Err(InfoBaseError::MissingUpdateFile(update_file.to_string()));
        }

        let connection = self.connection_args();
        let launch = |source| InfoBaseError::Launch {
            base: self.name.clone(),
            source,
        };

        let designer = runner
            .designer(
                &connection,
                &[
                    "/UpdateCfg".to_string(),
                    update_file.to_string(),
                    "/UpdateDBCfg".to_string(),
                    "-Dynamic+".to_string(),
                ],
            )
            .map_err(launch)?;
        info!(base = %self.name, code = designer.code, "designer update finished");

        let enterprise = runner.enterprise(&connection, &[]).map_err(launch)?;
        info!(base = %self.name, code = enterprise.code, "enterprise run finished");

        Ok(UpdateReport {
            base: self.name.clone(),
            designer_code: designer.code,
            enterprise_code: enterprise.code,
        })
    }
}
