//! blelink CLI configuration management
//!
//! Configuration is layered with figment, lowest priority first:
//! - built-in defaults
//! - `blelink.toml` in the working directory
//! - `~/.blelink/config.toml`
//! - `BLELINK_*` environment variables, nested keys separated by `__`
//!   (`BLELINK_LINK__RECONNECT_INTERVAL=10000`)
//!
//! `--config FILE` replaces the two file layers and `--data-dir` overrides
//! where state is kept.

use std::path::{Path, PathBuf};

use blelink_ble::BleAdapterConfig;
use blelink_core::LinkConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the per-user configuration directory under `$HOME`
const APP_DIR: &str = ".blelink";

/// File holding the identity and the recent-peer directory
const STATE_FILE: &str = "state.json";

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Loading(String),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("File system error: {0}")]
    FileSystem(String),
}

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Link timings and capacities
    pub link: LinkConfig,

    /// Platform adapter settings
    pub ble: BleAdapterConfig,

    /// Terminal behaviour and state location
    pub cli: CliConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Where the identity and recent peers are stored (defaults to ~/.blelink)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Print debug-level link log lines in the session view
    pub show_debug_logs: bool,
}

impl AppConfig {
    /// Load configuration with the standard priority order
    pub fn load() -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("blelink.toml"))
            .merge(Toml::file(Self::default_config_path()?))
            .merge(Env::prefixed("BLELINK_").split("__"));
        Self::extract(figment)
    }

    /// Load configuration from a specific file, ignoring the standard files
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Loading(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BLELINK_").split("__"));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Override the state directory
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cli.data_dir = Some(dir.into());
        self
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.ble.connection_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "BLE connection timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory the identity and recent peers live in
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.cli.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(home_dir()?.join(APP_DIR)),
        }
    }

    /// File backing the key/value store
    pub fn state_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join(STATE_FILE))
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        Ok(home_dir()?.join(APP_DIR).join("config.toml"))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialization(e.to_string()))
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_config_path()?;
        self.save_to_file(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::FileSystem(format!("Failed to create config directory: {}", e))
            })?;
        }
        std::fs::write(path.as_ref(), self.to_toml()?)
            .map_err(|e| ConfigError::FileSystem(format!("Failed to write config file: {}", e)))
    }
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .ok_or_else(|| ConfigError::Environment("Could not determine home directory".to_string()))
}
