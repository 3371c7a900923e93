//! Core library for cfrelease.
//!
//! This crate provides the release pipeline used by the `cfrelease` CLI:
//! driving the platform client, editing the dumped configuration, building
//! distribution files and pushing them to the network share.
//!
//! # Modules
//!
//! - [`artifacts`] - Build directory scanning and artifact placement
//! - [`config`] - Configuration loading and management
//! - [`dump`] - Version edits in the dumped configuration XML
//! - [`error`] - Error types and result aliases
//! - [`infobase`] - Applying update files to application instances
//! - [`platform`] - Starting the platform client
//! - [`preflight`] - Release readiness checks
//! - [`storage`] - The release pipeline orchestrator
//! - [`version`] - Four-part version arithmetic
//!
//! # Quick Start
//!
//! ```no_run
//! use cfrelease_core::storage::Storage;
//! use cfrelease_core::version::BumpLevel;
//! use cfrelease_core::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_user_config(true)
//!     .load()
//!     .expect("Failed to load configuration");
//! let settings = config
//!     .storage_settings(camino::Utf8Path::new("."))
//!     .expect("incomplete [storage] section");
//!
//! let mut storage = Storage::from_settings(&settings);
//! match storage.make_new_version(BumpLevel::Build, |_| {}) {
//!     Ok(outcome) => println!("released {}", outcome.version),
//!     Err(err) => eprintln!("{err} (exit code {})", err.exit_code()),
//! }
//! ```
#![deny(unsafe_code)]

pub mod artifacts;

pub mod config;

pub mod dump;

pub mod error;

pub mod infobase;

pub mod platform;

pub mod preflight;

pub mod storage;

pub mod version;

pub use config::{BaseConfig, Config, ConfigLoader, LogLevel, StorageConfig, StorageSettings};

pub use error::{ConfigError, ConfigResult};
