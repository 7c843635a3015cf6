//! BlueZ peripheral transport using bluer
//!
//! The GATT application is built from the [`ServiceLayout`] the link asks for.
//! BlueZ answers reads and writes through async callbacks; each callback turns
//! into a [`PeripheralEvent`] with a fresh request id and then waits for the
//! link's `send_response` on a oneshot. BlueZ also owns the client
//! configuration descriptor and fans a notification out to every subscriber,
//! so no descriptor write requests are reported and one pushed value reaches
//! all subscribed centrals.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blelink_core::protocol::CharacteristicLayout;
use blelink_core::{
    lock, AdvertisementData, AdvertisementHandle, GattServer, GattStatus, LinkError,
    PeripheralEvent, PeripheralTransport, Result, ServiceLayout,
};
use bluer::adv::{Advertisement, AdvertisementHandle as BluezAdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier,
    CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead,
    CharacteristicReadRequest, CharacteristicWrite, CharacteristicWriteMethod,
    CharacteristicWriteRequest, ReqError, ReqResult, Service,
};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BleAdapterConfig;
use crate::error::BleAdapterError;

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// Peripheral transport backed by a BlueZ adapter
pub struct BluezPeripheral {
    _session: Session,
    adapter: Adapter,
    runtime: Handle,
    config: BleAdapterConfig,
    events: mpsc::UnboundedSender<PeripheralEvent>,
}

impl BluezPeripheral {
    /// Open the configured adapter, power it on and start watching it
    pub async fn new(
        config: BleAdapterConfig,
    ) -> std::result::Result<(Arc<Self>, mpsc::UnboundedReceiver<PeripheralEvent>), BleAdapterError>
    {
        let session = Session::new()
            .await
            .map_err(|e| BleAdapterError::ManagerInit(e.to_string()))?;
        let name = session
            .adapter_names()
            .await
            .map_err(|e| BleAdapterError::ManagerInit(e.to_string()))?
            .into_iter()
            .nth(config.adapter_index)
            .ok_or(BleAdapterError::AdapterNotAvailable)?;
        let adapter = session
            .adapter(&name)
            .map_err(|_| BleAdapterError::AdapterNotAvailable)?;

        if !adapter.is_powered().await.unwrap_or(false) {
            adapter
                .set_powered(true)
                .await
                .map_err(|e| BleAdapterError::PowerOn(e.to_string()))?;
        }

        let adapter_events = adapter
            .events()
            .await
            .map_err(|e| BleAdapterError::EventStreamFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = DeviceWatcher {
            adapter: adapter.clone(),
            events: tx.clone(),
            watched: Arc::new(Mutex::new(HashSet::new())),
        };
        for address in adapter.device_addresses().await.unwrap_or_default() {
            watcher.watch(address);
        }
        tokio::spawn(async move {
            let mut adapter_events = adapter_events;
            while let Some(event) = adapter_events.next().await {
                match event {
                    AdapterEvent::DeviceAdded(address) => watcher.watch(address),
                    AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                        if watcher
                            .events
                            .send(PeripheralEvent::AdapterStateChanged { powered })
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            debug!("BlueZ adapter event stream ended");
        });

        info!("BlueZ adapter {} initialized for peripheral role", name);
        let peripheral = Arc::new(Self {
            _session: session,
            adapter,
            runtime: Handle::current(),
            config,
            events: tx,
        });
        Ok((peripheral, rx))
    }
}

/// Reports connection changes of remote devices
struct DeviceWatcher {
    adapter: Adapter,
    events: mpsc::UnboundedSender<PeripheralEvent>,
    watched: Arc<Mutex<HashSet<Address>>>,
}

impl DeviceWatcher {
    fn watch(&self, address: Address) {
        if !lock(&self.watched).insert(address) {
            return;
        }
        let Ok(device) = self.adapter.device(address) else {
            lock(&self.watched).remove(&address);
            return;
        };
        let events = self.events.clone();
        let watched = self.watched.clone();
        tokio::spawn(async move {
            if let Ok(mut device_events) = device.events().await {
                while let Some(DeviceEvent::PropertyChanged(property)) = device_events.next().await
                {
                    if let DeviceProperty::Connected(connected) = property {
                        let event = PeripheralEvent::ConnectionStateChanged {
                            address: address.to_string(),
                            connected,
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
            lock(&watched).remove(&address);
        });
    }
}

impl PeripheralTransport for BluezPeripheral {
    fn supports_advertising(&self) -> bool {
        true
    }

    fn start_advertising(&self, data: &AdvertisementData) -> Result<Box<dyn AdvertisementHandle>> {
        let advertisement = Advertisement {
            advertisement_type: Type::Peripheral,
            service_uuids: BTreeSet::from([data.service_uuid]),
            service_data: data
                .service_data
                .iter()
                .map(|(uuid, payload)| (*uuid, payload.clone()))
                .collect::<BTreeMap<_, _>>(),
            discoverable: Some(true),
            ..Default::default()
        };

        let slot = Arc::new(AdvertisementSlot::default());
        let task_slot = slot.clone();
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let event = match adapter.advertise(advertisement).await {
                Ok(handle) => {
                    if task_slot.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    *lock(&task_slot.handle) = Some(handle);
                    PeripheralEvent::AdvertisingStarted
                }
                Err(e) => PeripheralEvent::AdvertisingFailed {
                    reason: BleAdapterError::AdvertisingFailed(e.to_string()).to_string(),
                },
            };
            let _ = events.send(event);
        });

        Ok(Box::new(BluezAdvertisement { slot }))
    }

    fn open_gatt_server(&self, service: &ServiceLayout) -> Result<Box<dyn GattServer>> {
        let shared = Arc::new(ServerShared::new(
            self.events.clone(),
            self.config.response_timeout,
            service,
        ));
        let application = build_application(&shared, service);

        let adapter = self.adapter.clone();
        let task_shared = shared.clone();
        self.runtime.spawn(async move {
            match adapter.serve_gatt_application(application).await {
                Ok(handle) => {
                    if !task_shared.closed.load(Ordering::SeqCst) {
                        *lock(&task_shared.application) = Some(handle);
                        info!("GATT application registered");
                    }
                }
                Err(e) => {
                    let reason = BleAdapterError::GattRegistration(e.to_string()).to_string();
                    warn!("{}", reason);
                    let _ = task_shared
                        .events
                        .send(PeripheralEvent::AdvertisingFailed { reason });
                }
            }
        });

        Ok(Box::new(BluezServer { shared }))
    }
}

// ----------------------------------------------------------------------------
// Advertisement
// ----------------------------------------------------------------------------

#[derive(Default)]
struct AdvertisementSlot {
    handle: Mutex<Option<BluezAdvertisementHandle>>,
    stopped: AtomicBool,
}

struct BluezAdvertisement {
    slot: Arc<AdvertisementSlot>,
}

impl AdvertisementHandle for BluezAdvertisement {
    fn stop(&self) -> Result<()> {
        if self.slot.stopped.swap(true, Ordering::SeqCst) {
            return Err(LinkError::transport("advertising already stopped"));
        }
        // dropping the handle unregisters the advertisement
        lock(&self.slot.handle).take();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// GATT Server
// ----------------------------------------------------------------------------

struct Reply {
    status: GattStatus,
    value: Option<Vec<u8>>,
}

struct NotifyValue {
    value: Vec<u8>,
    pushed: bool,
    sender: watch::Sender<Vec<u8>>,
}

struct ServerShared {
    events: mpsc::UnboundedSender<PeripheralEvent>,
    response_timeout: Duration,
    next_request: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Reply>>>,
    values: Mutex<HashMap<Uuid, NotifyValue>>,
    application: Mutex<Option<ApplicationHandle>>,
    closed: AtomicBool,
}

impl ServerShared {
    fn new(
        events: mpsc::UnboundedSender<PeripheralEvent>,
        response_timeout: Duration,
        service: &ServiceLayout,
    ) -> Self {
        let values = service
            .characteristics
            .iter()
            .filter(|c| c.properties.notify)
            .map(|c| {
                let (sender, _) = watch::channel(Vec::new());
                (
                    c.uuid,
                    NotifyValue {
                        value: Vec::new(),
                        pushed: true,
                        sender,
                    },
                )
            })
            .collect();

        Self {
            events,
            response_timeout,
            next_request: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            values: Mutex::new(values),
            application: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn register(&self) -> (u32, oneshot::Receiver<Reply>) {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, tx);
        (request_id, rx)
    }

    async fn await_reply(&self, request_id: u32, rx: oneshot::Receiver<Reply>) -> ReqResult<Vec<u8>> {
        match timeout(self.response_timeout, rx).await {
            Ok(Ok(reply)) => match reply.status {
                GattStatus::Success => Ok(reply.value.unwrap_or_default()),
                GattStatus::RequestNotSupported => Err(ReqError::NotSupported),
                GattStatus::Failure => Err(ReqError::Failed),
            },
            _ => {
                lock(&self.pending).remove(&request_id);
                debug!("GATT request {} went unanswered", request_id);
                Err(ReqError::Failed)
            }
        }
    }

    async fn read(&self, characteristic: Uuid, request: CharacteristicReadRequest) -> ReqResult<Vec<u8>> {
        let (request_id, rx) = self.register();
        let event = PeripheralEvent::ReadRequest {
            address: request.device_address.to_string(),
            request_id,
            characteristic,
            offset: usize::from(request.offset),
        };
        if self.events.send(event).is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(ReqError::Failed);
        }
        self.await_reply(request_id, rx).await
    }

    async fn write(
        &self,
        characteristic: Uuid,
        value: Vec<u8>,
        request: CharacteristicWriteRequest,
    ) -> ReqResult<()> {
        let response_needed = matches!(request.op_type, WriteOp::Request);
        let address = request.device_address.to_string();

        if !response_needed {
            let _ = self.events.send(PeripheralEvent::WriteRequest {
                address,
                request_id: self.next_request.fetch_add(1, Ordering::SeqCst),
                characteristic,
                value,
                response_needed,
            });
            return Ok(());
        }

        let (request_id, rx) = self.register();
        let event = PeripheralEvent::WriteRequest {
            address,
            request_id,
            characteristic,
            value,
            response_needed,
        };
        if self.events.send(event).is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(ReqError::Failed);
        }
        self.await_reply(request_id, rx).await.map(|_| ())
    }

    fn subscribe(&self, characteristic: Uuid) -> Option<watch::Receiver<Vec<u8>>> {
        lock(&self.values)
            .get(&characteristic)
            .map(|slot| slot.sender.subscribe())
    }
}

type ReadFuture = Pin<Box<dyn Future<Output = ReqResult<Vec<u8>>> + Send>>;
type WriteFuture = Pin<Box<dyn Future<Output = ReqResult<()>> + Send>>;
type NotifyFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn build_characteristic(shared: &Arc<ServerShared>, layout: &CharacteristicLayout) -> Characteristic {
    let uuid = layout.uuid;
    let properties = layout.properties;

    let read = properties.read.then(|| {
        let shared = shared.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |request| -> ReadFuture {
                let shared = shared.clone();
                Box::pin(async move { shared.read(uuid, request).await })
            }),
            ..Default::default()
        }
    });

    let write = (properties.write || properties.write_without_response).then(|| {
        let shared = shared.clone();
        CharacteristicWrite {
            write: properties.write,
            write_without_response: properties.write_without_response,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, request| -> WriteFuture {
                let shared = shared.clone();
                Box::pin(async move { shared.write(uuid, value, request).await })
            })),
            ..Default::default()
        }
    });

    let notify = properties.notify.then(|| {
        let shared = shared.clone();
        CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(
                move |notifier: CharacteristicNotifier| -> NotifyFuture {
                    let values = shared.subscribe(uuid);
                    Box::pin(forward_notifications(values, notifier))
                },
            )),
            ..Default::default()
        }
    });

    Characteristic {
        uuid,
        read,
        write,
        notify,
        ..Default::default()
    }
}

/// Push every new value to one notification session until it ends
async fn forward_notifications(
    values: Option<watch::Receiver<Vec<u8>>>,
    mut notifier: CharacteristicNotifier,
) {
    let Some(mut values) = values else {
        return;
    };
    while values.changed().await.is_ok() {
        let value = values.borrow_and_update().clone();
        if notifier.is_stopped() {
            break;
        }
        if let Err(e) = notifier.notify(value).await {
            debug!("Notification session ended: {}", e);
            break;
        }
    }
}

fn build_application(shared: &Arc<ServerShared>, service: &ServiceLayout) -> Application {
    Application {
        services: vec![Service {
            uuid: service.uuid,
            primary: true,
            characteristics: service
                .characteristics
                .iter()
                .map(|c| build_characteristic(shared, c))
                .collect(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

struct BluezServer {
    shared: Arc<ServerShared>,
}

impl GattServer for BluezServer {
    fn send_response(
        &self,
        _address: &str,
        request_id: u32,
        status: GattStatus,
        value: Option<&[u8]>,
    ) -> Result<()> {
        let Some(reply) = lock(&self.shared.pending).remove(&request_id) else {
            // writes without response never register a responder
            return Ok(());
        };
        reply
            .send(Reply {
                status,
                value: value.map(<[u8]>::to_vec),
            })
            .map_err(|_| LinkError::transport(format!("request {} timed out", request_id)))
    }

    fn set_characteristic_value(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let mut values = lock(&self.shared.values);
        let slot = values
            .get_mut(&characteristic)
            .ok_or(LinkError::CharacteristicNotFound { characteristic })?;
        slot.value = value.to_vec();
        slot.pushed = false;
        Ok(())
    }

    fn notify_characteristic_changed(
        &self,
        address: &str,
        characteristic: Uuid,
        _confirm: bool,
    ) -> Result<()> {
        {
            let mut values = lock(&self.shared.values);
            let slot = values
                .get_mut(&characteristic)
                .ok_or(LinkError::CharacteristicNotFound { characteristic })?;
            // BlueZ fans one push out to every subscriber
            if !slot.pushed {
                slot.pushed = true;
                slot.sender.send_replace(slot.value.clone());
            }
        }
        let _ = self.shared.events.send(PeripheralEvent::NotificationSent {
            address: address.to_string(),
            result: Ok(()),
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(LinkError::GattServer("server already closed".to_string()));
        }
        // dropping the handle unregisters the application
        lock(&self.shared.application).take();
        lock(&self.shared.pending).clear();
        Ok(())
    }
}
