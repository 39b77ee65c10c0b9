//! Configuration management for creditsync
//!
//! Settings are layered from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use creditsync::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Polling active jobs every {}", config.polling.active_jobs);
//! ```
//!
//! # Environment Variables
//!
//! Overrides follow the pattern `CREDITSYNC__<section>__<key>`:
//! - `CREDITSYNC__POLICY__STALE_AFTER=3m`
//! - `CREDITSYNC__POLLING__ACTIVE_JOBS=2s`
//! - `CREDITSYNC__REMOTE__BASE_URL=https://studio.example.com`
//!
//! The bearer token for the backend is read from `CREDITSYNC_API_TOKEN` only.
//!
//! # Configuration File
//!
//! Loaded from `config/creditsync.toml` unless `CREDITSYNC_CONFIG` points
//! elsewhere.

mod models;
mod sources;
mod validation;

pub use crate::humanize::HumanDuration;
pub use models::{
    Config, IdentityConfig, PolicyConfig, PollingConfig, RemoteConfig, RetentionConfig,
    ServerConfig, StorageConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Environment overrides and the API token apply exactly as in [`Config::load`].
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_path(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate(self)
    }
}
