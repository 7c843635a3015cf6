//! blelink CLI library
//!
//! Terminal front end for the two-role link: argument parsing, layered
//! configuration, a printing [`LinkCallback`](blelink_core::LinkCallback)
//! and the command handlers.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod host;

pub use cli::{Cli, Commands, RoleArg};
pub use commands::{CommandDispatcher, SessionInput};
pub use config::{AppConfig, ConfigError};
pub use error::{CliError, Result};
pub use host::TerminalHost;
