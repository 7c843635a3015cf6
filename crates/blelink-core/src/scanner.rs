//! Time-boxed discovery sessions
//!
//! A session is filtered to the message service and reports each distinct
//! `(address, peer_id)` pair once. Advertisements without an identity payload
//! are ignored. Sessions never overlap: starting a new one stops the previous
//! one first, and each session stops itself when its duration elapses. A scan
//! that fails to start is reported and left alone; retrying is the caller's
//! business.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::host::HostLog;
use crate::lock;
use crate::protocol::{Advertisement, SERVICE_UUID};
use crate::timer::ScheduledTask;
use crate::transport::{CentralTransport, ScanId};

// ----------------------------------------------------------------------------
// Discovered Peer
// ----------------------------------------------------------------------------

/// A peer seen during a scan; `address` may rotate while `peer_id` stays put
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredPeer {
    pub address: String,
    pub peer_id: String,
}

// ----------------------------------------------------------------------------
// Scanner
// ----------------------------------------------------------------------------

struct ScanSession {
    generation: u64,
    seen: HashSet<DiscoveredPeer>,
    timeout: Option<ScheduledTask>,
}

struct ScannerState {
    session: Option<ScanSession>,
    next_generation: u64,
}

struct ScannerShared {
    transport: Arc<dyn CentralTransport>,
    log: HostLog,
    state: Mutex<ScannerState>,
}

/// Discovery sessions over a [`CentralTransport`]
#[derive(Clone)]
pub struct Scanner {
    shared: Arc<ScannerShared>,
}

impl Scanner {
    pub(crate) fn new(transport: Arc<dyn CentralTransport>, log: HostLog) -> Self {
        Self {
            shared: Arc::new(ScannerShared {
                transport,
                log,
                state: Mutex::new(ScannerState {
                    session: None,
                    next_generation: 0,
                }),
            }),
        }
    }

    /// Start a session that stops itself after `duration`
    ///
    /// The session is in place before the transport is asked to scan, so
    /// results delivered while `start_scan` is still running are kept.
    pub fn start_scan(&self, duration: Duration) {
        if self.is_scanning() {
            self.stop_scan();
        }

        let generation = {
            let mut state = lock(&self.shared.state);
            let generation = state.next_generation;
            state.next_generation += 1;
            state.session = Some(ScanSession {
                generation,
                seen: HashSet::new(),
                timeout: None,
            });
            generation
        };

        if let Err(e) = self
            .shared
            .transport
            .start_scan(SERVICE_UUID, ScanId(generation))
        {
            self.take_generation(generation);
            self.shared.log.error(format!("Scan failed: {}", e));
            return;
        }
        self.shared.log.debug("Scan started");

        let weak: Weak<ScannerShared> = Arc::downgrade(&self.shared);
        let timeout = ScheduledTask::once(duration, move || {
            if let Some(shared) = weak.upgrade() {
                Scanner { shared }.stop_generation(generation);
            }
        });

        let mut state = lock(&self.shared.state);
        match state.session.as_mut() {
            Some(session) if session.generation == generation => session.timeout = Some(timeout),
            _ => timeout.cancel(),
        }
    }

    /// Stop the current session, if any
    pub fn stop_scan(&self) {
        let session = lock(&self.shared.state).session.take();
        if let Some(session) = session {
            self.finish(session);
        }
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.shared.state).session.is_some()
    }

    /// Filter a raw scan result; returns the peer on its first sighting in
    /// the current session
    pub fn handle_advertisement(&self, advertisement: &Advertisement) -> Option<DiscoveredPeer> {
        let peer_id = advertisement.peer_id()?;
        if !advertisement.services.is_empty() && !advertisement.services.contains(&SERVICE_UUID) {
            return None;
        }

        let peer = DiscoveredPeer {
            address: advertisement.address.clone(),
            peer_id,
        };

        let mut state = lock(&self.shared.state);
        let session = state.session.as_mut()?;
        if !session.seen.insert(peer.clone()) {
            return None;
        }
        drop(state);

        let name = advertisement
            .local_name
            .clone()
            .unwrap_or_else(|| peer.address.clone());
        self.shared
            .log
            .debug(format!("Found device: {} ({})", name, peer.peer_id));
        Some(peer)
    }

    /// A transport reported that scan `scan` died; only the session it
    /// belongs to is ended
    pub fn handle_scan_failed(&self, scan: ScanId, reason: &str) {
        match self.take_generation(scan.0) {
            Some(session) => {
                if let Some(timeout) = session.timeout {
                    timeout.cancel();
                }
                self.shared.log.error(format!("Scan failed: {}", reason));
            }
            None => self
                .shared
                .log
                .debug(format!("Ignoring failure of finished {}: {}", scan, reason)),
        }
    }

    fn stop_generation(&self, generation: u64) {
        if let Some(session) = self.take_generation(generation) {
            self.finish(session);
        }
    }

    fn take_generation(&self, generation: u64) -> Option<ScanSession> {
        let mut state = lock(&self.shared.state);
        match state.session.as_ref() {
            Some(session) if session.generation == generation => state.session.take(),
            _ => None,
        }
    }

    fn finish(&self, session: ScanSession) {
        if let Some(timeout) = session.timeout {
            timeout.cancel();
        }
        if let Err(e) = self.shared.transport.stop_scan() {
            self.shared.log.warn(format!("Failed to stop scan: {}", e));
        }
        self.shared.log.debug("Scan stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LogLevel;
    use crate::mock::{CentralCall, MockCentral, RecordingHost};
    use crate::protocol::{encode_identity_payload, SERVICE_DATA_UUID};
    use tokio::time;
    use uuid::Uuid;

    fn scanner() -> (Scanner, Arc<MockCentral>, Arc<RecordingHost>) {
        let transport = Arc::new(MockCentral::new());
        let host = Arc::new(RecordingHost::new());
        let scanner = Scanner::new(transport.clone(), HostLog::new(host.clone(), "scanner"));
        (scanner, transport, host)
    }

    fn advertisement(address: &str, peer_id: &str) -> Advertisement {
        let mut adv = Advertisement {
            address: address.to_string(),
            services: vec![SERVICE_UUID],
            ..Default::default()
        };
        adv.service_data
            .insert(SERVICE_DATA_UUID, encode_identity_payload(peer_id));
        adv
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_stops_after_duration() {
        let (scanner, transport, _host) = scanner();
        scanner.start_scan(Duration::from_secs(5));
        assert!(scanner.is_scanning());

        time::sleep(Duration::from_millis(4_999)).await;
        assert!(scanner.is_scanning());
        time::sleep(Duration::from_millis(2)).await;
        assert!(!scanner.is_scanning());
        assert_eq!(
            transport.calls(),
            vec![CentralCall::StartScan, CentralCall::StopScan]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_stops_previous_session_first() {
        let (scanner, transport, _host) = scanner();
        scanner.start_scan(Duration::from_secs(5));
        time::sleep(Duration::from_secs(3)).await;
        scanner.start_scan(Duration::from_secs(5));

        // the first session's timeout must not end the second one
        time::sleep(Duration::from_secs(3)).await;
        assert!(scanner.is_scanning());
        assert_eq!(
            transport.calls(),
            vec![
                CentralCall::StartScan,
                CentralCall::StopScan,
                CentralCall::StartScan
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_peer_reported_once_per_session() {
        let (scanner, _transport, _host) = scanner();
        scanner.start_scan(Duration::from_secs(5));

        let first = scanner.handle_advertisement(&advertisement("X", "ABC123"));
        assert_eq!(
            first,
            Some(DiscoveredPeer {
                address: "X".to_string(),
                peer_id: "ABC123".to_string()
            })
        );
        assert_eq!(scanner.handle_advertisement(&advertisement("X", "ABC123")), None);

        // a rotated address is a new pair
        assert!(scanner
            .handle_advertisement(&advertisement("Y", "ABC123"))
            .is_some());

        // a fresh session reports everything again
        scanner.start_scan(Duration::from_secs(5));
        assert!(scanner
            .handle_advertisement(&advertisement("X", "ABC123"))
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_anonymous_and_foreign_advertisements() {
        let (scanner, _transport, _host) = scanner();
        scanner.start_scan(Duration::from_secs(5));

        let anonymous = Advertisement {
            address: "X".to_string(),
            services: vec![SERVICE_UUID],
            ..Default::default()
        };
        assert_eq!(scanner.handle_advertisement(&anonymous), None);

        let mut foreign = advertisement("Y", "ABC123");
        foreign.services = vec![Uuid::from_u128(0x180D)];
        assert_eq!(scanner.handle_advertisement(&foreign), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_outside_session_are_dropped() {
        let (scanner, _transport, _host) = scanner();
        assert_eq!(scanner.handle_advertisement(&advertisement("X", "ABC123")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_is_logged_without_retry() {
        let (scanner, transport, host) = scanner();
        transport.fail_scan(true);
        scanner.start_scan(Duration::from_secs(5));

        assert!(!scanner.is_scanning());
        assert!(host.has_log(LogLevel::Error, "Scan failed"));
        time::sleep(Duration::from_secs(30)).await;
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_event_ends_session() {
        let (scanner, transport, host) = scanner();
        scanner.start_scan(Duration::from_secs(5));
        let scan = transport.last_scan().unwrap();
        scanner.handle_scan_failed(scan, "SCAN_FAILED_INTERNAL_ERROR");

        assert!(!scanner.is_scanning());
        assert!(host.has_log(LogLevel::Error, "SCAN_FAILED_INTERNAL_ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_of_previous_scan_keeps_current_session() {
        let (scanner, transport, host) = scanner();
        scanner.start_scan(Duration::from_secs(5));
        let first = transport.last_scan().unwrap();
        scanner.start_scan(Duration::from_secs(5));
        assert_ne!(transport.last_scan(), Some(first));

        scanner.handle_scan_failed(first, "SCAN_FAILED_ALREADY_STARTED");
        assert!(scanner.is_scanning());
        assert!(!host.has_log(LogLevel::Error, "SCAN_FAILED_ALREADY_STARTED"));
        assert!(scanner
            .handle_advertisement(&advertisement("X", "ABC123"))
            .is_some());

        // the session still ends on its own schedule
        time::sleep(Duration::from_secs(6)).await;
        assert!(!scanner.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_delivered_during_start_are_kept() {
        let (scanner, transport, host) = scanner();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let target: Arc<Mutex<Option<Scanner>>> = Arc::default();
        {
            let reported = reported.clone();
            let target = target.clone();
            transport.on_scan_start(move || {
                if let Some(scanner) = lock(&target).as_ref() {
                    if let Some(peer) = scanner.handle_advertisement(&advertisement("X", "ABC123")) {
                        lock(&reported).push(peer);
                    }
                }
            });
        }
        *lock(&target) = Some(scanner.clone());

        scanner.start_scan(Duration::from_secs(5));
        transport.clear_hooks();

        assert_eq!(
            *lock(&reported),
            vec![DiscoveredPeer {
                address: "X".to_string(),
                peer_id: "ABC123".to_string()
            }]
        );
        assert!(scanner.is_scanning());
        assert!(host.has_log(LogLevel::Debug, "Found device"));
    }
}
