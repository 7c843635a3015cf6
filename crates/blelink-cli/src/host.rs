//! Terminal implementation of the link callback
//!
//! Link activity is printed one line per event. Peers surfaced by a scan are
//! numbered so `/connect 1` can pick one.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use blelink_core::{lock, DiscoveredPeer, LinkCallback, LogLevel};

// ----------------------------------------------------------------------------
// Terminal Host
// ----------------------------------------------------------------------------

/// Prints link callbacks to a writer, usually stdout
pub struct TerminalHost<W: Write + Send = io::Stdout> {
    out: Mutex<W>,
    label: Option<String>,
    min_level: LogLevel,
    discovered: Mutex<Vec<DiscoveredPeer>>,
}

impl TerminalHost<io::Stdout> {
    /// Print to stdout, hiding debug lines unless `show_debug` is set
    pub fn stdout(show_debug: bool) -> Self {
        Self::new(io::stdout(), show_debug)
    }
}

impl<W: Write + Send> TerminalHost<W> {
    pub fn new(out: W, show_debug: bool) -> Self {
        Self {
            out: Mutex::new(out),
            label: None,
            min_level: if show_debug {
                LogLevel::Debug
            } else {
                LogLevel::Info
            },
            discovered: Mutex::new(Vec::new()),
        }
    }

    /// Prefix every line with `label`, for sessions sharing one terminal
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Peers surfaced so far, in the order they were numbered
    pub fn discovered(&self) -> Vec<DiscoveredPeer> {
        lock(&self.discovered).clone()
    }

    /// Resolve a `/connect` target: a 1-based index or a listed address
    pub fn resolve(&self, target: &str) -> Option<DiscoveredPeer> {
        let discovered = lock(&self.discovered);
        if let Ok(index) = target.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|i| discovered.get(i))
                .cloned();
        }
        discovered.iter().find(|p| p.address == target).cloned()
    }

    /// Print a line that did not come from a link
    pub fn print(&self, line: &str) {
        let mut out = lock(&self.out);
        let result = match &self.label {
            Some(label) => writeln!(out, "{:>8} | {}", label, line),
            None => writeln!(out, "{}", line),
        };
        if result.is_ok() {
            let _ = out.flush();
        }
    }

    /// Take back the writer, for inspecting output
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> LinkCallback for TerminalHost<W> {
    fn on_connected(&self) {
        self.print("[*] Connected");
    }

    fn on_message_received(&self, text: &str) {
        self.print(&format!("> {}", text));
    }

    fn on_log(&self, level: LogLevel, text: &str) {
        if level >= self.min_level {
            self.print(&format!("[{}] {}", level.tag(), text));
        }
    }

    fn on_peer_discovered(&self, peer: &DiscoveredPeer) {
        let index = {
            let mut discovered = lock(&self.discovered);
            match discovered.iter().position(|p| p == peer) {
                Some(existing) => existing + 1,
                None => {
                    discovered.push(peer.clone());
                    discovered.len()
                }
            }
        };
        self.print(&format!(
            "[+] {}. {} at {}  (/connect {})",
            index, peer.peer_id, peer.address, index
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(address: &str, peer_id: &str) -> DiscoveredPeer {
        DiscoveredPeer {
            address: address.to_string(),
            peer_id: peer_id.to_string(),
        }
    }

    fn output(host: TerminalHost<Vec<u8>>) -> String {
        String::from_utf8(host.into_inner()).unwrap()
    }

    #[test]
    fn test_debug_lines_hidden_by_default() {
        let host = TerminalHost::new(Vec::new(), false);
        host.on_log(LogLevel::Debug, "noise");
        host.on_log(LogLevel::Warn, "Choose Client or Server");
        assert_eq!(output(host), "[W] Choose Client or Server\n");

        let host = TerminalHost::new(Vec::new(), true);
        host.on_log(LogLevel::Debug, "noise");
        assert_eq!(output(host), "[D] noise\n");
    }

    #[test]
    fn test_discovered_peers_are_numbered_once() {
        let host = TerminalHost::new(Vec::new(), false);
        host.on_peer_discovered(&peer("X", "ABC123"));
        host.on_peer_discovered(&peer("Y", "DEF456"));
        host.on_peer_discovered(&peer("X", "ABC123"));

        assert_eq!(host.discovered().len(), 2);
        assert_eq!(host.resolve("2"), Some(peer("Y", "DEF456")));
        assert_eq!(host.resolve("X"), Some(peer("X", "ABC123")));
        assert_eq!(host.resolve("0"), None);
        assert_eq!(host.resolve("3"), None);

        let text = output(host);
        assert!(text.contains("[+] 1. ABC123 at X"));
        assert_eq!(text.matches("[+] 1.").count(), 2);
    }

    #[test]
    fn test_label_prefixes_lines() {
        let host = TerminalHost::new(Vec::new(), false).with_label("server");
        host.on_message_received("hi");
        host.on_connected();
        assert_eq!(output(host), "  server | > hi\n  server | [*] Connected\n");
    }
}
