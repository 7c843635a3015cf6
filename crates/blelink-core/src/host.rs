//! Host application callback interface
//!
//! The UI layer is out of scope; it plugs in by implementing [`LinkCallback`].
//! Every log line the core produces goes to the host and to `tracing`.

use std::fmt;
use std::sync::Arc;

use crate::scanner::DiscoveredPeer;

// ----------------------------------------------------------------------------
// Log Level
// ----------------------------------------------------------------------------

/// Severity of a host log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// One-letter tag shown next to log lines
    pub fn tag(self) -> char {
        match self {
            LogLevel::Debug => 'D',
            LogLevel::Info => 'I',
            LogLevel::Warn => 'W',
            LogLevel::Error => 'E',
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Callback Trait
// ----------------------------------------------------------------------------

/// Events a link reports to the host application
///
/// Callbacks may arrive from any thread and are never invoked while a link
/// holds its internal lock, so implementations are free to call back into
/// the link.
pub trait LinkCallback: Send + Sync {
    /// The central finished subscribing and the link is usable
    fn on_connected(&self);

    /// A message arrived from the other side
    fn on_message_received(&self, text: &str);

    /// A log line for the host's log view
    fn on_log(&self, level: LogLevel, text: &str);

    /// A scan found a peer that is not in the recent-peer directory
    fn on_peer_discovered(&self, _peer: &DiscoveredPeer) {}
}

// ----------------------------------------------------------------------------
// Host Logger
// ----------------------------------------------------------------------------

/// Sends log lines to the host and mirrors them into `tracing`
#[derive(Clone)]
pub(crate) struct HostLog {
    callback: Arc<dyn LinkCallback>,
    component: &'static str,
}

impl HostLog {
    pub(crate) fn new(callback: Arc<dyn LinkCallback>, component: &'static str) -> Self {
        Self {
            callback,
            component,
        }
    }

    pub(crate) fn callback(&self) -> &Arc<dyn LinkCallback> {
        &self.callback
    }

    pub(crate) fn log(&self, level: LogLevel, text: impl AsRef<str>) {
        let text = text.as_ref();
        match level {
            LogLevel::Debug => tracing::debug!(component = self.component, "{}", text),
            LogLevel::Info => tracing::info!(component = self.component, "{}", text),
            LogLevel::Warn => tracing::warn!(component = self.component, "{}", text),
            LogLevel::Error => tracing::error!(component = self.component, "{}", text),
        }
        self.callback.on_log(level, text);
    }

    pub(crate) fn debug(&self, text: impl AsRef<str>) {
        self.log(LogLevel::Debug, text);
    }

    pub(crate) fn info(&self, text: impl AsRef<str>) {
        self.log(LogLevel::Info, text);
    }

    pub(crate) fn warn(&self, text: impl AsRef<str>) {
        self.log(LogLevel::Warn, text);
    }

    pub(crate) fn error(&self, text: impl AsRef<str>) {
        self.log(LogLevel::Error, text);
    }
}

// ----------------------------------------------------------------------------
// Deferred Notifications
// ----------------------------------------------------------------------------

/// Host notifications collected while a link holds its lock and delivered
/// once it is released
#[derive(Default)]
pub(crate) struct Outbox {
    logs: Vec<(LogLevel, String)>,
    connected: bool,
    messages: Vec<String>,
}

impl Outbox {
    pub(crate) fn log(&mut self, level: LogLevel, text: impl Into<String>) {
        self.logs.push((level, text.into()));
    }

    pub(crate) fn connected(&mut self) {
        self.connected = true;
    }

    pub(crate) fn message(&mut self, text: String) {
        self.messages.push(text);
    }

    /// Logs first, then the connected signal, then messages
    pub(crate) fn deliver(self, log: &HostLog) {
        for (level, text) in self.logs {
            log.log(level, text);
        }
        if self.connected {
            log.callback().on_connected();
        }
        for message in self.messages {
            log.callback().on_message_received(&message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_and_names() {
        assert_eq!(LogLevel::Info.tag(), 'I');
        assert_eq!(LogLevel::Warn.tag(), 'W');
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
        assert!(LogLevel::Debug < LogLevel::Error);
    }
}
