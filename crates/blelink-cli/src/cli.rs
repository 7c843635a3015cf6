//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Data directory for the identity and recent peers
    #[arg(short, long)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive session on the local radio
    Chat {
        /// Role to take on start; switch later with /client or /server
        #[arg(short, long, value_enum)]
        role: Option<RoleArg>,
    },
    /// Show this device's identifier
    Identity,
    /// List peers remembered for reconnection
    Peers {
        /// Forget every remembered peer
        #[arg(long)]
        clear: bool,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Also write it to ~/.blelink/config.toml
        #[arg(long)]
        write: bool,
    },
    /// Run a client and a server against a simulated radio
    Demo {
        /// Messages the client sends once connected
        #[arg(default_values_t = vec!["hello".to_string()])]
        messages: Vec<String>,
    },
}

/// Role selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    /// Scan for and connect to a server
    Client,
    /// Advertise and wait for a client
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_chat_role() {
        let cli = Cli::parse_from(["blelink", "-v", "chat", "--role", "server"]);
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Chat {
                role: Some(RoleArg::Server)
            }
        ));
    }

    #[test]
    fn test_demo_defaults_to_one_message() {
        let cli = Cli::parse_from(["blelink", "demo"]);
        match cli.command {
            Commands::Demo { messages } => assert_eq!(messages, vec!["hello"]),
            _ => panic!("expected demo"),
        }
    }
}
