//! btleplug central adapter
//!
//! Implements [`CentralTransport`] on top of btleplug. Every trait call spawns
//! the matching async btleplug operation on the runtime the adapter was
//! created in and returns at once; results come back on the event channel.
//! btleplug writes the notification descriptor itself when subscribing, so a
//! write to that descriptor is mapped onto `subscribe`/`unsubscribe`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use blelink_core::protocol::{
    CharacteristicLayout, CharacteristicProperties, ENABLE_NOTIFICATION_VALUE,
    NOTIFY_DESCRIPTOR_UUID,
};
use blelink_core::{
    lock, Advertisement, CentralEvent, CentralTransport, ConnectionId, ConnectionOutcome,
    GattConnection, LinkError, Result, ScanId, ServiceLayout, WriteType,
};
use btleplug::api::{
    BDAddr, Central as _, CentralEvent as AdapterEvent, CharPropFlags, Characteristic,
    Manager as _, Peripheral as _, ScanFilter, WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BleAdapterConfig;
use crate::error::BleAdapterError;

// ----------------------------------------------------------------------------
// Adapter
// ----------------------------------------------------------------------------

/// Which connection each connected device belongs to, so disconnects can be
/// routed back to the right handle
struct LinkTable<K> {
    entries: Mutex<HashMap<K, ConnectionId>>,
}

impl<K: Eq + Hash> LinkTable<K> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record `key` for `connection` unless its handle was already released;
    /// `closed` is checked under the table lock so a concurrent `forget`
    /// cannot be overtaken
    fn register(&self, key: K, connection: ConnectionId, closed: &AtomicBool) -> bool {
        let mut entries = lock(&self.entries);
        if closed.load(Ordering::SeqCst) {
            return false;
        }
        entries.insert(key, connection);
        true
    }

    fn forget(&self, connection: ConnectionId) {
        lock(&self.entries).retain(|_, owner| *owner != connection);
    }

    fn take(&self, key: &K) -> Option<ConnectionId> {
        lock(&self.entries).remove(key)
    }
}

type Links = Arc<LinkTable<PeripheralId>>;

/// Central transport backed by a btleplug adapter
pub struct BtleplugCentral {
    adapter: Adapter,
    runtime: Handle,
    config: BleAdapterConfig,
    events: mpsc::UnboundedSender<CentralEvent>,
    links: Links,
    next_connection: AtomicU64,
}

impl BtleplugCentral {
    /// Open the configured adapter and start forwarding its events
    pub async fn new(
        config: BleAdapterConfig,
    ) -> std::result::Result<(Arc<Self>, mpsc::UnboundedReceiver<CentralEvent>), BleAdapterError>
    {
        let manager = Manager::new()
            .await
            .map_err(|e| BleAdapterError::ManagerInit(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleAdapterError::ManagerInit(e.to_string()))?
            .into_iter()
            .nth(config.adapter_index)
            .ok_or(BleAdapterError::AdapterNotAvailable)?;

        let adapter_events = adapter
            .events()
            .await
            .map_err(|e| BleAdapterError::EventStreamFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let central = Arc::new(Self {
            adapter: adapter.clone(),
            runtime: Handle::current(),
            config,
            events: tx.clone(),
            links: Arc::new(LinkTable::new()),
            next_connection: AtomicU64::new(1),
        });

        let links = central.links.clone();
        tokio::spawn(async move {
            let mut adapter_events = adapter_events;
            while let Some(event) = adapter_events.next().await {
                if !forward_adapter_event(&adapter, &links, &tx, event).await {
                    break;
                }
            }
            debug!("BLE adapter event stream ended");
        });

        info!("BLE central adapter initialized");
        Ok((central, rx))
    }
}

/// Translate one btleplug event; returns `false` once nobody is listening
async fn forward_adapter_event(
    adapter: &Adapter,
    links: &Links,
    events: &mpsc::UnboundedSender<CentralEvent>,
    event: AdapterEvent,
) -> bool {
    match event {
        AdapterEvent::DeviceDiscovered(id)
        | AdapterEvent::DeviceUpdated(id)
        | AdapterEvent::ServiceDataAdvertisement { id, .. }
        | AdapterEvent::ServicesAdvertisement { id, .. } => {
            let Ok(peripheral) = adapter.peripheral(&id).await else {
                return true;
            };
            let Ok(Some(properties)) = peripheral.properties().await else {
                return true;
            };
            let advertisement = Advertisement {
                address: address_of(&peripheral, properties.address),
                local_name: properties.local_name,
                services: properties.services,
                service_data: properties.service_data,
            };
            events.send(CentralEvent::Advertisement(advertisement)).is_ok()
        }
        AdapterEvent::DeviceDisconnected(id) => {
            let connection = links.take(&id);
            let Some(connection) = connection else {
                return true;
            };
            let address = match adapter.peripheral(&id).await {
                Ok(peripheral) => address_of(&peripheral, peripheral.address()),
                Err(_) => format!("{:?}", id),
            };
            events
                .send(CentralEvent::ConnectionStateChanged {
                    connection,
                    address,
                    outcome: ConnectionOutcome::Disconnected,
                })
                .is_ok()
        }
        _ => true,
    }
}

/// Platforms that hide the hardware address report it as all zeroes; fall
/// back to the platform identifier there
fn address_of(peripheral: &Peripheral, address: BDAddr) -> String {
    if address.into_inner() == [0u8; 6] {
        format!("{:?}", peripheral.id())
    } else {
        address.to_string()
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Option<Peripheral> {
    let peripherals = adapter.peripherals().await.ok()?;
    peripherals
        .into_iter()
        .find(|p| address_of(p, p.address()) == address)
}

impl CentralTransport for BtleplugCentral {
    fn is_enabled(&self) -> bool {
        !self.events.is_closed()
    }

    fn start_scan(&self, service: Uuid, scan: ScanId) -> Result<()> {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let filter = ScanFilter {
                services: vec![service],
            };
            if let Err(e) = adapter.start_scan(filter).await {
                let _ = events.send(CentralEvent::ScanFailed {
                    scan,
                    reason: BleAdapterError::ScanFailed(e.to_string()).to_string(),
                });
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&self, address: &str) -> Result<Box<dyn GattConnection>> {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));
        let shared = Arc::new(ConnectionShared {
            id,
            address: address.to_string(),
            runtime: self.runtime.clone(),
            events: self.events.clone(),
            links: self.links.clone(),
            peripheral: Mutex::new(None),
            notifications: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let adapter = self.adapter.clone();
        let connect_timeout = self.config.connection_timeout;
        let task = shared.clone();
        self.runtime.spawn(async move {
            let outcome = match find_peripheral(&adapter, &task.address).await {
                None => ConnectionOutcome::Failed(
                    BleAdapterError::DeviceNotFound {
                        address: task.address.clone(),
                    }
                    .to_string(),
                ),
                Some(peripheral) => match timeout(connect_timeout, peripheral.connect()).await {
                    Ok(Ok(())) => {
                        if !task.links.register(peripheral.id(), task.id, &task.closed) {
                            debug!("{} released before connecting, dropping the link", task.id);
                            if let Err(e) = peripheral.disconnect().await {
                                warn!("Failed to disconnect: {}", e);
                            }
                            return;
                        }
                        task.set_peripheral(peripheral);
                        ConnectionOutcome::Connected
                    }
                    Ok(Err(e)) => ConnectionOutcome::Failed(
                        BleAdapterError::ConnectionFailed(e.to_string()).to_string(),
                    ),
                    Err(_) => {
                        ConnectionOutcome::Failed(BleAdapterError::ConnectionTimeout.to_string())
                    }
                },
            };
            task.emit(CentralEvent::ConnectionStateChanged {
                connection: task.id,
                address: task.address.clone(),
                outcome,
            });
        });

        Ok(Box::new(BtleplugConnection { shared }))
    }
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

struct ConnectionShared {
    id: ConnectionId,
    address: String,
    runtime: Handle,
    events: mpsc::UnboundedSender<CentralEvent>,
    links: Links,
    peripheral: Mutex<Option<Peripheral>>,
    notifications: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionShared {
    fn emit(&self, event: CentralEvent) {
        let _ = self.events.send(event);
    }

    fn set_peripheral(&self, peripheral: Peripheral) {
        if let Ok(mut slot) = self.peripheral.lock() {
            *slot = Some(peripheral);
        }
    }

    fn peripheral(&self) -> Result<Peripheral> {
        self.peripheral
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(LinkError::NotConnected)
    }

    fn stop_notifications(&self) {
        if let Some(task) = self.notifications.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
    }
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> std::result::Result<Characteristic, String> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| {
            BleAdapterError::CharacteristicNotFound {
                characteristic: uuid.to_string(),
            }
            .to_string()
        })
}

fn service_layouts(peripheral: &Peripheral) -> Vec<ServiceLayout> {
    peripheral
        .services()
        .into_iter()
        .map(|service| ServiceLayout {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| CharacteristicLayout {
                    uuid: c.uuid,
                    properties: CharacteristicProperties {
                        read: c.properties.contains(CharPropFlags::READ),
                        write: c.properties.contains(CharPropFlags::WRITE),
                        write_without_response: c
                            .properties
                            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                        notify: c.properties.contains(CharPropFlags::NOTIFY),
                    },
                    descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                })
                .collect(),
        })
        .collect()
}

/// One btleplug connection as seen by the central link
struct BtleplugConnection {
    shared: Arc<ConnectionShared>,
}

impl GattConnection for BtleplugConnection {
    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    fn address(&self) -> &str {
        &self.shared.address
    }

    fn discover_services(&self) -> Result<()> {
        let peripheral = self.shared.peripheral()?;
        let shared = self.shared.clone();
        self.shared.runtime.spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(service_layouts(&peripheral)),
                Err(e) => Err(e.to_string()),
            };
            shared.emit(CentralEvent::ServicesDiscovered {
                connection: shared.id,
                result,
            });
        });
        Ok(())
    }

    fn set_notifications(&self, _characteristic: Uuid, enabled: bool) -> Result<()> {
        if !enabled {
            self.shared.stop_notifications();
            return Ok(());
        }

        let peripheral = self.shared.peripheral()?;
        let shared = self.shared.clone();
        let task = self.shared.runtime.spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to get notifications stream: {}", e);
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                shared.emit(CentralEvent::Notification {
                    connection: shared.id,
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
            debug!("Notification stream for {} ended", shared.id);
        });

        if let Ok(mut slot) = self.shared.notifications.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }

    fn write_descriptor(&self, characteristic_uuid: Uuid, descriptor: Uuid, value: &[u8]) -> Result<()> {
        let peripheral = self.shared.peripheral()?;
        let shared = self.shared.clone();
        let value = value.to_vec();
        self.shared.runtime.spawn(async move {
            let result = match characteristic(&peripheral, characteristic_uuid) {
                Err(reason) => Err(reason),
                Ok(c) if descriptor == NOTIFY_DESCRIPTOR_UUID => {
                    let outcome = if value == ENABLE_NOTIFICATION_VALUE {
                        peripheral.subscribe(&c).await
                    } else {
                        peripheral.unsubscribe(&c).await
                    };
                    outcome.map_err(|e| e.to_string())
                }
                Ok(c) => match c.descriptors.iter().find(|d| d.uuid == descriptor) {
                    Some(d) => peripheral
                        .write_descriptor(d, &value)
                        .await
                        .map_err(|e| e.to_string()),
                    None => Err(format!("Descriptor not found: {}", descriptor)),
                },
            };
            shared.emit(CentralEvent::DescriptorWritten {
                connection: shared.id,
                descriptor,
                result,
            });
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic_uuid: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let peripheral = self.shared.peripheral()?;
        let shared = self.shared.clone();
        let value = value.to_vec();
        let write_type = match write_type {
            WriteType::WithResponse => BtleWriteType::WithResponse,
            WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
        };
        self.shared.runtime.spawn(async move {
            let result = match characteristic(&peripheral, characteristic_uuid) {
                Ok(c) => peripheral
                    .write(&c, &value, write_type)
                    .await
                    .map_err(|e| e.to_string()),
                Err(reason) => Err(reason),
            };
            shared.emit(CentralEvent::CharacteristicWritten {
                connection: shared.id,
                characteristic: characteristic_uuid,
                result,
            });
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let peripheral = self.shared.peripheral()?;
        self.shared.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect: {}", e);
            }
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(LinkError::transport("connection already closed"));
        }
        self.shared.links.forget(self.shared.id);
        self.shared.stop_notifications();
        if let Ok(mut slot) = self.shared.peripheral.lock() {
            slot.take();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_handle_is_never_registered() {
        let table = LinkTable::new();
        let closed = AtomicBool::new(false);
        assert!(table.register("AA:01", ConnectionId(1), &closed));

        let released = AtomicBool::new(true);
        assert!(!table.register("AA:02", ConnectionId(2), &released));
        assert_eq!(table.take(&"AA:02"), None);
        assert_eq!(table.take(&"AA:01"), Some(ConnectionId(1)));
    }

    #[test]
    fn test_forget_drops_only_that_connection() {
        let table = LinkTable::new();
        let open = AtomicBool::new(false);
        table.register("AA:01", ConnectionId(1), &open);
        table.register("AA:02", ConnectionId(2), &open);

        table.forget(ConnectionId(1));
        assert_eq!(table.take(&"AA:01"), None);
        assert_eq!(table.take(&"AA:02"), Some(ConnectionId(2)));
    }
}
