//! Command handlers for the blelink CLI

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use blelink_ble::{platform_central, platform_peripheral};
use blelink_core::sim::SimRadio;
use blelink_core::{
    spawn_central_event_pump, spawn_peripheral_event_pump, FileStore, IdentityStore,
    MemoryStore, PeripheralLink, RecentPeerDirectory, Role, RoleCoordinator,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::cli::{Cli, Commands, RoleArg};
use crate::config::AppConfig;
use crate::error::{CliError, Result};
use crate::host::TerminalHost;

const HELP: &str = "\
Commands:
  /client              scan for and connect to a server
  /server              advertise and wait for a client
  /connect <n|addr>    connect to a discovered server
  /peers               list discovered and remembered peers
  /status              show the current role and link state
  /help                show this help
  /quit                leave the session
Anything else is sent as a message.";

// ----------------------------------------------------------------------------
// Session Input
// ----------------------------------------------------------------------------

/// One line typed into an interactive session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Client,
    Server,
    Connect(String),
    Peers,
    Status,
    Help,
    Quit,
    Send(String),
    Empty,
    Invalid(String),
}

impl SessionInput {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return SessionInput::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return SessionInput::Send(line.to_string());
        };

        let mut parts = command.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("client"), None) => SessionInput::Client,
            (Some("server"), None) => SessionInput::Server,
            (Some("connect"), Some(target)) => SessionInput::Connect(target.to_string()),
            (Some("connect"), None) => {
                SessionInput::Invalid("usage: /connect <n|address>".to_string())
            }
            (Some("peers"), None) => SessionInput::Peers,
            (Some("status"), None) => SessionInput::Status,
            (Some("help"), None) => SessionInput::Help,
            (Some("quit"), None) | (Some("exit"), None) => SessionInput::Quit,
            _ => SessionInput::Invalid(format!("unknown command: /{}", command)),
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Chat { role } => Self::handle_chat_command(config, role).await,
            Commands::Identity => Self::handle_identity_command(&config),
            Commands::Peers { clear } => Self::handle_peers_command(&config, clear),
            Commands::Config { write } => Self::handle_config_command(&config, write),
            Commands::Demo { messages } => Self::handle_demo_command(config, messages).await,
        }
    }

    fn open_store(config: &AppConfig) -> Result<Arc<FileStore>> {
        let path = config.state_file()?;
        debug!("Using state file {}", path.display());
        Ok(Arc::new(FileStore::open(path)?))
    }

    /// Print this device's identifier, creating it on first use
    fn handle_identity_command(config: &AppConfig) -> Result<()> {
        let store = Self::open_store(config)?;
        let identity = IdentityStore::new(store.clone());
        println!("Device ID: {}", identity.get_or_create_id());
        println!("Stored in: {}", store.path().display());
        Ok(())
    }

    fn handle_peers_command(config: &AppConfig, clear: bool) -> Result<()> {
        let store = Self::open_store(config)?;
        let directory = RecentPeerDirectory::with_capacity(store, config.link.recent_peer_capacity);
        if clear {
            directory.clear();
            println!("Forgot all remembered peers");
            return Ok(());
        }

        let entries = directory.entries();
        if entries.is_empty() {
            println!("No remembered peers");
        }
        for entry in entries {
            println!("{}  {}", entry.peer_id, entry.address);
        }
        Ok(())
    }

    fn handle_config_command(config: &AppConfig, write: bool) -> Result<()> {
        print!("{}", config.to_toml()?);
        if write {
            let path = config.save()?;
            println!("# written to {}", path.display());
        }
        Ok(())
    }

    /// Interactive session on the local radio
    async fn handle_chat_command(config: AppConfig, role: Option<RoleArg>) -> Result<()> {
        let store = Self::open_store(&config)?;
        let (central, central_events) = platform_central(config.ble.clone())
            .await
            .map_err(|e| {
                CliError::TransportInit(format!(
                    "{} (build with `--features ble` for real radios, or try `blelink demo`)",
                    e
                ))
            })?;
        let (peripheral, peripheral_events) = platform_peripheral(config.ble.clone()).await?;

        let host = Arc::new(TerminalHost::stdout(config.cli.show_debug_logs));
        let coordinator = RoleCoordinator::build(
            config.link.clone(),
            central,
            peripheral,
            store.clone(),
            host.clone(),
        );
        spawn_central_event_pump(coordinator.central(), central_events);
        spawn_peripheral_event_pump(coordinator.peripheral(), peripheral_events);

        host.print(&format!("Device ID: {}", coordinator.peripheral().device_id()));
        match role {
            Some(RoleArg::Client) => coordinator.switch_to_central(),
            Some(RoleArg::Server) => coordinator.switch_to_peripheral(),
            None => host.print(HELP),
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                break;
            };
            if !Self::handle_session_input(&coordinator, &host, SessionInput::parse(&line)) {
                break;
            }
        }

        coordinator.shutdown();
        info!("Session closed");
        Ok(())
    }

    /// Apply one line of input; returns `false` when the session should end
    fn handle_session_input<W: Write + Send>(
        coordinator: &RoleCoordinator,
        host: &TerminalHost<W>,
        input: SessionInput,
    ) -> bool {
        match input {
            SessionInput::Client => coordinator.switch_to_central(),
            SessionInput::Server => coordinator.switch_to_peripheral(),
            SessionInput::Connect(target) => match host.resolve(&target) {
                Some(peer) => coordinator.connect(&peer.address, &peer.peer_id),
                None => host.print(&format!("No discovered peer {}", target)),
            },
            SessionInput::Peers => {
                for (i, peer) in host.discovered().iter().enumerate() {
                    host.print(&format!("{}. {} at {}", i + 1, peer.peer_id, peer.address));
                }
                for entry in coordinator.central().recent_peers() {
                    host.print(&format!("*  {} last at {}", entry.peer_id, entry.address));
                }
            }
            SessionInput::Status => host.print(&Self::status_line(coordinator)),
            SessionInput::Help => host.print(HELP),
            SessionInput::Quit => return false,
            SessionInput::Send(text) => coordinator.send_message(&text),
            SessionInput::Invalid(reason) => host.print(&reason),
            SessionInput::Empty => {}
        }
        true
    }

    fn status_line(coordinator: &RoleCoordinator) -> String {
        match coordinator.role() {
            Role::None => "No role selected".to_string(),
            Role::Central => {
                let central = coordinator.central();
                match central.connected_peer() {
                    Some(peer) => format!(
                        "Client, {} with {} at {}",
                        central.state(),
                        peer.peer_id,
                        peer.address
                    ),
                    None => format!(
                        "Client, {}{}",
                        central.state(),
                        if central.is_scanning() { ", scanning" } else { "" }
                    ),
                }
            }
            Role::Peripheral => {
                let peripheral = coordinator.peripheral();
                format!(
                    "Server, {}advertising, {} peer(s)",
                    if peripheral.is_advertising() { "" } else { "not " },
                    peripheral.peer_count()
                )
            }
        }
    }

    /// A client and a server talking over the simulated radio
    async fn handle_demo_command(config: AppConfig, messages: Vec<String>) -> Result<()> {
        let radio = SimRadio::new();
        let show_debug = config.cli.show_debug_logs;

        let (server_transport, server_events) = radio.peripheral("5E:00:00:00:00:01");
        let server_host = Arc::new(TerminalHost::stdout(show_debug).with_label("server"));
        let server = PeripheralLink::new(
            config.link.clone(),
            server_transport,
            IdentityStore::new(Arc::new(MemoryStore::new())),
            server_host.clone(),
        );
        spawn_peripheral_event_pump(&server, server_events);

        let (central, central_events) = radio.central("C1:00:00:00:00:01");
        let (peripheral, peripheral_events) = radio.peripheral("C1:00:00:00:00:01");
        let client_host = Arc::new(TerminalHost::stdout(show_debug).with_label("client"));
        let client = RoleCoordinator::build(
            config.link.clone(),
            central,
            peripheral,
            Arc::new(MemoryStore::new()),
            client_host.clone(),
        );
        spawn_central_event_pump(client.central(), central_events);
        spawn_peripheral_event_pump(client.peripheral(), peripheral_events);

        server.start_advertising();
        client.switch_to_central();

        let Some(peer) = Self::wait_for(Duration::from_secs(2), || {
            client_host.discovered().into_iter().next()
        })
        .await
        else {
            return Err(CliError::TransportInit("demo server was never discovered".to_string()));
        };
        client.connect(&peer.address, &peer.peer_id);

        let connected = Self::wait_for(Duration::from_secs(2), || {
            client.central().is_connected().then_some(())
        })
        .await;
        if connected.is_none() {
            return Err(CliError::TransportInit("demo link never became ready".to_string()));
        }

        for message in &messages {
            client_host.print(&format!("< {}", message));
            client.send_message(message);
            sleep(config.link.write_delay + Duration::from_millis(100)).await;

            let reply = format!("echo: {}", message);
            server_host.print(&format!("< {}", reply));
            server.send_message_to_all(&reply);
            sleep(Duration::from_millis(100)).await;
        }

        client.shutdown();
        server.stop_advertising();
        println!(
            "Demo finished: {} write(s), {} notification(s)",
            radio.characteristic_writes(),
            radio.notifications_sent()
        );
        Ok(())
    }

    /// Poll `check` until it yields a value or `limit` passes
    async fn wait_for<T>(limit: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(value) = check() {
                return Some(value);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blelink_core::LinkConfig;

    #[test]
    fn test_plain_text_is_sent() {
        assert_eq!(
            SessionInput::parse("  hello there "),
            SessionInput::Send("hello there".to_string())
        );
        assert_eq!(SessionInput::parse("   "), SessionInput::Empty);
    }

    #[test]
    fn test_slash_commands() {
        assert_eq!(SessionInput::parse("/client"), SessionInput::Client);
        assert_eq!(SessionInput::parse("/server"), SessionInput::Server);
        assert_eq!(
            SessionInput::parse("/connect 2"),
            SessionInput::Connect("2".to_string())
        );
        assert_eq!(SessionInput::parse("/exit"), SessionInput::Quit);
        assert!(matches!(SessionInput::parse("/connect"), SessionInput::Invalid(_)));
        assert!(matches!(SessionInput::parse("/dance"), SessionInput::Invalid(_)));
    }

    #[tokio::test]
    async fn test_peers_lists_only_configured_capacity() {
        let store = Arc::new(MemoryStore::new());
        let seeded = RecentPeerDirectory::new(store.clone());
        for i in 1..=4 {
            seeded.remember(&format!("PEER0{}", i), &format!("AA:00:00:00:00:0{}", i));
        }

        let radio = SimRadio::new();
        let (central, _central_events) = radio.central("C0:00:00:00:00:01");
        let (peripheral, _peripheral_events) = radio.peripheral("P0:00:00:00:00:01");
        let coordinator = RoleCoordinator::build(
            LinkConfig::default().with_recent_peer_capacity(2),
            central,
            peripheral,
            store,
            Arc::new(TerminalHost::new(std::io::sink(), false)),
        );

        let host = TerminalHost::new(Vec::new(), false);
        assert!(CommandDispatcher::handle_session_input(
            &coordinator,
            &host,
            SessionInput::Peers
        ));
        let text = String::from_utf8(host.into_inner()).unwrap();
        assert_eq!(
            text,
            "*  PEER03 last at AA:00:00:00:00:03\n*  PEER04 last at AA:00:00:00:00:04\n"
        );
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_demo_exchanges_messages() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default().with_data_dir(dir.path());
        CommandDispatcher::handle_demo_command(config, vec!["hi".to_string()])
            .await
            .unwrap();
    }

    #[test]
    fn test_identity_is_persisted_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default().with_data_dir(dir.path());
        CommandDispatcher::handle_identity_command(&config).unwrap();

        let store = FileStore::open(config.state_file().unwrap()).unwrap();
        let first = IdentityStore::new(Arc::new(store)).get_or_create_id();
        CommandDispatcher::handle_identity_command(&config).unwrap();
        let store = FileStore::open(config.state_file().unwrap()).unwrap();
        assert_eq!(IdentityStore::new(Arc::new(store)).get_or_create_id(), first);
    }
}
