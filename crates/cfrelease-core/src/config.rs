//! Configuration loading and discovery.
//!
//! Configuration is layered with figment:
//! 1. Built-in defaults
//! 2. User config from the XDG config directory
//! 3. The nearest project config, walking up from the working directory
//! 4. Explicit files passed with `--config`
//!
//! # Supported formats
//!
//! TOML (`.toml`), YAML (`.yaml`, `.yml`) and JSON (`.json`).
//!
//! # Config file locations (in order of precedence, highest first):
//! - `.cfrelease.<ext>` in current directory or any parent
//! - `cfrelease.<ext>` in current directory or any parent
//! - `~/.config/cfrelease/config.<ext>` (user config)
//!
//! # Example
//!
//! ```toml
//! log_level = "info"
//! verbose = true
//!
//! [storage]
//! platform_exe = 'C:\Program Files\1cv8\bin\1cv8.exe'
//! build_path = 'D:\builds'
//! net_path = '\\fileserver\releases'
//! prev_amount_cf = 3
//! ib_server = "srv01\\erp_night"
//! ib_user = "builder"
//! path = "tcp://repo01/erp"
//! username = "night"
//! password = "secret"
//! config_name = "Erp"
//!
//! [[bases]]
//! name = "test"
//! server = "srv01\\erp_test"
//! user = "admin"
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use figment::Figment;
use figment::providers::{Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// The configuration for cfrelease.
///
/// Deserialized from config files found during discovery (TOML, YAML, or JSON).
/// The `[storage]` section is optional at load time so that commands like
/// `doctor` work without it; [`Config::storage_settings`] enforces it.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Log level for the application (e.g., "debug", "info", "warn", "error").
    pub log_level: LogLevel,
    /// Directory for JSONL log files (falls back to platform defaults if unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<Utf8PathBuf>,
    /// Report every platform invocation (command line, code, output) at info level.
    pub verbose: bool,
    /// Ask for confirmation before `release` runs (default: true on a terminal).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm: Option<bool>,
    /// Repository and build settings for the release pipeline.
    pub storage: Option<StorageConfig>,
    /// Application instances that receive the update file after a release.
    pub bases: Vec<BaseConfig>,
}

/// The `[storage]` section as written in config files.
///
/// Every field is optional here so that a partially written file still
/// loads; [`StorageConfig::resolve`] reports all missing keys at once.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Path to the platform client executable.
    pub platform_exe: Option<Utf8PathBuf>,
    /// Local directory holding one subdirectory per released version.
    pub build_path: Option<Utf8PathBuf>,
    /// Network directory the finished artifacts are copied to.
    pub net_path: Option<Utf8PathBuf>,
    /// How many previous releases feed the update file.
    pub prev_amount_cf: Option<usize>,
    /// Application instance server address (`/s`).
    pub ib_server: Option<String>,
    /// Application instance user (`/N`).
    pub ib_user: Option<String>,
    /// Application instance password (`/P`), omitted when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ib_password: Option<String>,
    /// Repository location (`/ConfigurationRepositoryF`).
    pub path: Option<String>,
    /// Repository user (`/ConfigurationRepositoryN`).
    pub username: Option<String>,
    /// Repository password (`/ConfigurationRepositoryP`).
    pub password: Option<String>,
    /// Configuration name as it appears in `ConfigDumpInfo.xml`.
    pub config_name: Option<String>,
    /// Working directory for dumps, diff and log files (default: current directory).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<Utf8PathBuf>,
    /// Run the platform through the system shell as a single command string.
    pub shell_mode: Option<bool>,
}

/// Validated storage settings, ready to build a [`Storage`](crate::storage::Storage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    /// Path to the platform client executable.
    pub platform_exe: Utf8PathBuf,
    /// Local directory holding one subdirectory per released version.
    pub build_path: Utf8PathBuf,
    /// Network directory the finished artifacts are copied to.
    pub net_path: Utf8PathBuf,
    /// How many previous releases feed the update file.
    pub prev_amount_cf: usize,
    /// Application instance server address.
    pub ib_server: String,
    /// Application instance user.
    pub ib_user: String,
    /// Application instance password.
    pub ib_password: Option<String>,
    /// Repository location.
    pub repo_path: String,
    /// Repository user.
    pub repo_user: String,
    /// Repository password.
    pub repo_password: String,
    /// Configuration name as it appears in `ConfigDumpInfo.xml`.
    pub config_name: String,
    /// Working directory for dumps, diff and log files.
    pub work_dir: Utf8PathBuf,
    /// Run the platform through the system shell.
    pub shell_mode: bool,
    /// Report every platform invocation at info level.
    pub verbose: bool,
}

impl StorageConfig {
    /// Check that every required key is present and build [`StorageSettings`].
    ///
    /// `default_work_dir` is used when `work_dir` is not configured.
    pub fn resolve(&self, default_work_dir: &Utf8Path) -> ConfigResult<StorageSettings> {
        let mut missing = Vec::new();

        macro_rules! required {
            ($field:ident) => {{
                if self.$field.is_none() {
                    missing.push(stringify!($field));
                }
                self.$field.clone()
            }};
        }

        let platform_exe = required!(platform_exe);
        let build_path = required!(build_path);
        let net_path = required!(net_path);
        let prev_amount_cf = required!(prev_amount_cf);
        let ib_server = required!(ib_server);
        let ib_user = required!(ib_user);
        let path = required!(path);
        let username = required!(username);
        let password = required!(password);
        let config_name = required!(config_name);

        let (
            Some(platform_exe),
            Some(build_path),
            Some(net_path),
            Some(prev_amount_cf),
            Some(ib_server),
            Some(ib_user),
            Some(repo_path),
            Some(repo_user),
            Some(repo_password),
            Some(config_name),
        ) = (
            platform_exe,
            build_path,
            net_path,
            prev_amount_cf,
            ib_server,
            ib_user,
            path,
            username,
            password,
            config_name,
        )
        else {
            return Err(ConfigError::MissingKeys(missing));
        };

        Ok(StorageSettings {
            platform_exe,
            build_path,
            net_path,
            prev_amount_cf,
            ib_server,
            ib_user,
            ib_password: self.ib_password.clone(),
            repo_path,
            repo_user,
            repo_password,
            config_name,
            work_dir: self
                .work_dir
                .clone()
                .unwrap_or_else(|| default_work_dir.to_path_buf()),
            shell_mode: self.shell_mode.unwrap_or(false),
            verbose: false,
        })
    }
}

/// An application instance that receives update files.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BaseConfig {
    /// Short name used in output and `--base` filters.
    pub name: String,
    /// Server address (`/s`).
    pub server: String,
    /// User name (`/N`).
    pub user: String,
    /// Password (`/P`), omitted when unset or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Config {
    /// Resolve the `[storage]` section into validated settings.
    ///
    /// The top-level `verbose` flag is carried into the settings so the
    /// platform invoker receives it explicitly.
    pub fn storage_settings(&self, default_work_dir: &Utf8Path) -> ConfigResult<StorageSettings> {
        let storage = self.storage.as_ref().ok_or(ConfigError::MissingStorage)?;
        let mut settings = storage.resolve(default_work_dir)?;
        settings.verbose = self.verbose;
        Ok(settings)
    }

    /// A starter configuration with placeholder values for every required key.
    pub fn template() -> Self {
        Self {
            storage: Some(StorageConfig {
                platform_exe: Some("C:/Program Files/1cv8/bin/1cv8.exe".into()),
                build_path: Some("D:/builds".into()),
                net_path: Some("//fileserver/releases".into()),
                prev_amount_cf: Some(3),
                ib_server: Some("server/infobase".into()),
                ib_user: Some("builder".into()),
                ib_password: None,
                path: Some("tcp://repository/config".into()),
                username: Some("night".into()),
                password: Some(String::new()),
                config_name: Some("Configuration".into()),
                work_dir: None,
                shell_mode: Some(false),
            }),
            ..Self::default()
        }
    }
}

/// Log level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose output for debugging and development.
    Debug,
    /// Standard operational information (default).
    #[default]
    Info,
    /// Warnings about potential issues.
    Warn,
    /// Errors that indicate failures.
    Error,
}

impl LogLevel {
    /// Returns the log level as a lowercase string slice.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Supported configuration file extensions (in order of preference).
const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json"];

/// Application name for XDG directory lookup and config file names.
const APP_NAME: &str = "cfrelease";

/// Builder for loading configuration from multiple sources.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Starting directory for project config search.
    project_search_root: Option<Utf8PathBuf>,
    /// Whether to include user config from XDG directory.
    include_user_config: bool,
    /// Stop searching when we hit a directory containing this file/dir.
    boundary_marker: Option<String>,
    /// Explicit config files to load.
    explicit_files: Vec<Utf8PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default settings.
    pub fn new() -> Self {
        Self {
            project_search_root: None,
            include_user_config: true,
            boundary_marker: Some(".git".to_string()),
            explicit_files: Vec::new(),
        }
    }

    /// Set the starting directory for project config search.
    pub fn with_project_search<P: AsRef<Utf8Path>>(mut self, path: P) -> Self {
        self.project_search_root = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set whether to include user config from `~/.config/cfrelease/`.
    pub const fn with_user_config(mut self, include: bool) -> Self {
        self.include_user_config = include;
        self
    }

    /// Set a boundary marker to stop directory traversal. Default is `.git`.
    pub fn with_boundary_marker<S: Into<String>>(mut self, marker: S) -> Self {
        self.boundary_marker = Some(marker.into());
        self
    }

    /// Disable boundary marker (search all the way to filesystem root).
    pub fn without_boundary_marker(mut self) -> Self {
        self.boundary_marker = None;
        self
    }

    /// Add an explicit config file to load. Later files take precedence.
    pub fn with_file<P: AsRef<Utf8Path>>(mut self, path: P) -> Self {
        self.explicit_files.push(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration, merging all discovered sources.
    ///
    /// Precedence (highest to lowest):
    /// 1. Explicit files (in order added via `with_file`)
    /// 2. Project config (closest to search root)
    /// 3. User config (`~/.config/cfrelease/config.<ext>`)
    /// 4. Default values
    #[tracing::instrument(skip(self), fields(search_root = ?self.project_search_root))]
    pub fn load(self) -> ConfigResult<Config> {
        tracing::debug!("loading configuration");
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if self.include_user_config
            && let Some(user_config) = find_user_config()
        {
            figment = merge_file(figment, &user_config);
        }

        if let Some(ref root) = self.project_search_root
            && let Some(project_config) = self.find_project_config(root)
        {
            figment = merge_file(figment, &project_config);
        }

        for file in &self.explicit_files {
            figment = merge_file(figment, file);
        }

        let config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Deserialize(Box::new(e)))?;
        tracing::info!(
            log_level = config.log_level.as_str(),
            has_storage = config.storage.is_some(),
            bases = config.bases.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration, returning an error if no config file is found.
    pub fn load_or_error(self) -> ConfigResult<Config> {
        let has_user = self.include_user_config && find_user_config().is_some();
        let has_project = self
            .project_search_root
            .as_ref()
            .and_then(|root| self.find_project_config(root))
            .is_some();

        if !has_user && !has_project && self.explicit_files.is_empty() {
            return Err(ConfigError::NotFound);
        }

        self.load()
    }

    /// Find project config by walking up from the given directory.
    ///
    /// The directory holding the boundary marker is searched, then the walk
    /// stops.
    fn find_project_config(&self, start: &Utf8Path) -> Option<Utf8PathBuf> {
        for dir in start.ancestors() {
            for ext in CONFIG_EXTENSIONS {
                let dotfile = dir.join(format!(".{APP_NAME}.{ext}"));
                if dotfile.is_file() {
                    return Some(dotfile);
                }

                let regular = dir.join(format!("{APP_NAME}.{ext}"));
                if regular.is_file() {
                    return Some(regular);
                }
            }

            if let Some(ref marker) = self.boundary_marker
                && dir.join(marker).exists()
            {
                break;
            }
        }

        None
    }
}

/// Find user config in XDG config directory.
fn find_user_config() -> Option<Utf8PathBuf> {
    let config_dir = user_config_dir()?;
    CONFIG_EXTENSIONS
        .iter()
        .map(|ext| config_dir.join(format!("config.{ext}")))
        .find(|path| path.is_file())
}

/// Merge a config file into the figment, detecting format from extension.
fn merge_file(figment: Figment, path: &Utf8Path) -> Figment {
    match path.extension() {
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path.as_str())),
        Some("json") => figment.merge(Json::file_exact(path.as_str())),
        _ => figment.merge(Toml::file_exact(path.as_str())),
    }
}

/// Find the project config file that [`ConfigLoader::load`] would pick up,
/// without loading it. The search stops at the `.git` boundary.
pub fn find_project_config<P: AsRef<Utf8Path>>(start: P) -> Option<Utf8PathBuf> {
    ConfigLoader::new().find_project_config(start.as_ref())
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Get the user config directory path.
///
/// Returns `~/.config/cfrelease/` on Linux, `%APPDATA%\cfrelease\config\` on
/// Windows, and equivalent on other platforms.
pub fn user_config_dir() -> Option<Utf8PathBuf> {
    let proj_dirs = project_dirs()?;
    Utf8PathBuf::from_path_buf(proj_dirs.config_dir().to_path_buf()).ok()
}

/// Get the local data directory path (machine-specific, not synced).
pub fn user_data_local_dir() -> Option<Utf8PathBuf> {
    let proj_dirs = project_dirs()?;
    Utf8PathBuf::from_path_buf(proj_dirs.data_local_dir().to_path_buf()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const FULL_STORAGE: &str = r#"
[storage]
platform_exe = "/opt/platform/bin/client"
build_path = "/srv/builds"
net_path = "/mnt/releases"
prev_amount_cf = 3
ib_server = "srv01/erp_night"
ib_user = "builder"
path = "tcp://repo01/erp"
username = "night"
password = "secret"
config_name = "Erp"
"#;

    fn load_file(name: &str, contents: &str) -> Config {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join(name);
        fs::write(&config_path, contents).unwrap();
        let config_path = Utf8PathBuf::try_from(config_path).unwrap();

        ConfigLoader::new()
            .with_user_config(false)
            .with_file(&config_path)
            .load()
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.log_dir.is_none());
        assert!(!config.verbose);
        assert!(config.storage.is_none());
        assert!(config.bases.is_empty());
    }

    #[test]
    fn test_loader_builds_with_defaults() {
        let config = ConfigLoader::new()
            .with_user_config(false)
            .without_boundary_marker()
            .load()
            .unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_later_file_overrides_earlier() {
        let tmp = TempDir::new().unwrap();

        let base_config = tmp.path().join("base.toml");
        fs::write(&base_config, "log_level = \"warn\"\nverbose = true\n").unwrap();

        let override_config = tmp.path().join("override.toml");
        fs::write(&override_config, r#"log_level = "error""#).unwrap();

        let base_config = Utf8PathBuf::try_from(base_config).unwrap();
        let override_config = Utf8PathBuf::try_from(override_config).unwrap();

        let config = ConfigLoader::new()
            .with_user_config(false)
            .with_file(&base_config)
            .with_file(&override_config)
            .load()
            .unwrap();

        assert_eq!(config.log_level, LogLevel::Error);
        assert!(config.verbose);
    }

    #[test]
    fn test_project_config_discovery() {
        let tmp = TempDir::new().unwrap();
        let project_dir = tmp.path().join("project");
        let sub_dir = project_dir.join("work").join("deep");
        fs::create_dir_all(&sub_dir).unwrap();
        fs::write(project_dir.join(".cfrelease.toml"), r#"log_level = "debug""#).unwrap();

        let sub_dir = Utf8PathBuf::try_from(sub_dir).unwrap();
        let config = ConfigLoader::new()
            .with_user_config(false)
            .without_boundary_marker()
            .with_project_search(&sub_dir)
            .load()
            .unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_boundary_marker_stops_search() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("parent");
        let child = parent.join("child");
        let work = child.join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(parent.join(".cfrelease.toml"), r#"log_level = "warn""#).unwrap();
        fs::create_dir(child.join(".git")).unwrap();

        let work = Utf8PathBuf::try_from(work).unwrap();
        let config = ConfigLoader::new()
            .with_user_config(false)
            .with_boundary_marker(".git")
            .with_project_search(&work)
            .load()
            .unwrap();

        assert_eq!(config.log_level, LogLevel::Info);
        assert!(find_project_config(&work).is_none());
        assert_eq!(
            find_project_config(Utf8PathBuf::try_from(parent.clone()).unwrap()),
            Some(Utf8PathBuf::try_from(parent.join(".cfrelease.toml")).unwrap())
        );
    }

    #[test]
    fn test_config_beside_boundary_marker_is_found() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        let src = repo.join("src");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir(repo.join(".git")).unwrap();
        fs::write(repo.join(".cfrelease.toml"), r#"log_level = "error""#).unwrap();
        fs::write(tmp.path().join(".cfrelease.toml"), r#"log_level = "debug""#).unwrap();

        let src = Utf8PathBuf::try_from(src).unwrap();
        let config = ConfigLoader::new()
            .with_user_config(false)
            .with_boundary_marker(".git")
            .with_project_search(&src)
            .load()
            .unwrap();

        assert_eq!(config.log_level, LogLevel::Error);
        assert_eq!(
            find_project_config(&src),
            Some(Utf8PathBuf::try_from(repo.join(".cfrelease.toml")).unwrap())
        );
    }

    #[test]
    fn test_search_stops_at_start_holding_marker() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(repo.join(".git")).unwrap();
        fs::write(tmp.path().join(".cfrelease.toml"), r#"log_level = "debug""#).unwrap();

        let repo = Utf8PathBuf::try_from(repo).unwrap();
        assert!(find_project_config(&repo).is_none());
    }

    #[test]
    fn test_load_or_error_fails_when_no_config() {
        let result = ConfigLoader::new()
            .with_user_config(false)
            .without_boundary_marker()
            .load_or_error();

        assert!(matches!(result, Err(ConfigError::NotFound)));
    }

    #[test]
    fn test_full_storage_section_resolves() {
        let config = load_file("config.toml", FULL_STORAGE);
        let settings = config
            .storage_settings(Utf8Path::new("/var/nightly"))
            .unwrap();

        assert_eq!(settings.platform_exe, "/opt/platform/bin/client");
        assert_eq!(settings.prev_amount_cf, 3);
        assert_eq!(settings.repo_path, "tcp://repo01/erp");
        assert_eq!(settings.repo_user, "night");
        assert_eq!(settings.config_name, "Erp");
        assert_eq!(settings.work_dir, "/var/nightly");
        assert!(settings.ib_password.is_none());
        assert!(!settings.shell_mode);
    }

    #[test]
    fn test_work_dir_and_verbose_carried_into_settings() {
        let contents = format!("verbose = true\n{FULL_STORAGE}work_dir = \"/srv/work\"\nshell_mode = true\n");
        let config = load_file("config.toml", &contents);
        let settings = config.storage_settings(Utf8Path::new("/ignored")).unwrap();

        assert_eq!(settings.work_dir, "/srv/work");
        assert!(settings.shell_mode);
        assert!(settings.verbose);
    }

    #[test]
    fn test_missing_storage_section_is_an_error() {
        let config = Config::default();
        let err = config.storage_settings(Utf8Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingStorage));
    }

    #[test]
    fn test_missing_keys_are_reported_together() {
        let config = load_file(
            "config.yaml",
            "storage:\n  platform_exe: /opt/client\n  build_path: /srv/builds\n  prev_amount_cf: 2\n",
        );
        let err = config.storage_settings(Utf8Path::new(".")).unwrap_err();

        let ConfigError::MissingKeys(keys) = &err else {
            panic!("expected MissingKeys, got {err:?}");
        };
        assert_eq!(
            keys,
            &[
                "net_path",
                "ib_server",
                "ib_user",
                "path",
                "username",
                "password",
                "config_name"
            ]
        );
        assert!(err.to_string().contains("net_path, ib_server"));
    }

    #[test]
    fn test_bases_section_from_json() {
        let config = load_file(
            "config.json",
            r#"{"bases": [{"name": "test", "server": "srv/test", "user": "admin"},
                          {"name": "demo", "server": "srv/demo", "user": "admin", "password": "pw"}]}"#,
        );

        assert_eq!(config.bases.len(), 2);
        assert_eq!(config.bases[0].name, "test");
        assert!(config.bases[0].password.is_none());
        assert_eq!(config.bases[1].password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_template_resolves_without_missing_keys() {
        let template = Config::template();
        assert!(template.storage_settings(Utf8Path::new(".")).is_ok());
    }

    #[test]
    fn test_user_config_dir() {
        if let Some(path) = user_config_dir() {
            assert!(path.as_str().contains("cfrelease"));
        }
    }
}
