//! Error handling for the blelink CLI

use thiserror::Error;

use crate::config::ConfigError;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Link error: {0}")]
    Link(#[from] blelink_core::LinkError),

    #[error("BLE adapter error: {0}")]
    Adapter(#[from] blelink_ble::BleAdapterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport initialization failed: {0}")]
    TransportInit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
