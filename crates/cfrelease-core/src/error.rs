//! Error types for cfrelease-core

use thiserror::Error;

/// Errors that can occur when working with configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error("invalid configuration: {0}")]
    Deserialize(#[from] Box<figment::Error>),

    /// Configuration file not found after searching all locations.
    #[error("no configuration file found")]
    NotFound,

    /// The `[storage]` section is absent.
    #[error("missing [storage] section in configuration")]
    MissingStorage,

    /// Required `[storage]` keys are absent.
    #[error("missing required storage keys: {}", .0.join(", "))]
    MissingKeys(Vec<&'static str>),
}

/// Result type alias using [`ConfigError`].
pub type ConfigResult<T> = Result<T, ConfigError>;
