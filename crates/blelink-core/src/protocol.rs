//! Wire-level service contract shared by both roles
//!
//! Both the central and the peripheral compile in the same four 128-bit
//! identifiers, so a central built from this crate recognises any peripheral
//! built from it and vice versa.

use std::collections::HashMap;

use uuid::Uuid;

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Primary service carrying both message channels
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FFE0_0000_1000_8000_00805F9B34FB);

/// Write + read characteristic: central to peripheral messages and read probes
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000FFE1_0000_1000_8000_00805F9B34FB);

/// Notify characteristic: peripheral to central messages
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000FFE2_0000_1000_8000_00805F9B34FB);

/// Client characteristic configuration descriptor on the notify characteristic
pub const NOTIFY_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// Service-data key under which the advertiser publishes its device identifier
pub const SERVICE_DATA_UUID: Uuid = Uuid::from_u128(0x0000FFE3_0000_1000_8000_00805F9B34FB);

// ----------------------------------------------------------------------------
// Protocol Constants
// ----------------------------------------------------------------------------

/// Descriptor value that turns notifications on
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Descriptor value that turns notifications off
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Default answer to a read of the write characteristic
pub const READY_RESPONSE: &str = "Server Ready";

/// Length of a device identifier in characters
pub const DEVICE_ID_LEN: usize = 6;

// ----------------------------------------------------------------------------
// GATT Layout
// ----------------------------------------------------------------------------

/// Capabilities a characteristic declares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// A characteristic as published by a server or reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicLayout {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Uuid>,
}

/// A service as published by a server or reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLayout {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicLayout>,
}

impl ServiceLayout {
    /// The single primary service both roles agree on
    pub fn message_service() -> Self {
        Self {
            uuid: SERVICE_UUID,
            characteristics: vec![
                CharacteristicLayout {
                    uuid: WRITE_CHARACTERISTIC_UUID,
                    properties: CharacteristicProperties {
                        read: true,
                        write: true,
                        write_without_response: true,
                        notify: false,
                    },
                    descriptors: Vec::new(),
                },
                CharacteristicLayout {
                    uuid: NOTIFY_CHARACTERISTIC_UUID,
                    properties: CharacteristicProperties {
                        notify: true,
                        ..Default::default()
                    },
                    descriptors: vec![NOTIFY_DESCRIPTOR_UUID],
                },
            ],
        }
    }

    /// Look up a characteristic by UUID
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicLayout> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

impl CharacteristicLayout {
    /// Whether the characteristic carries the given descriptor
    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

/// How a characteristic write should be acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Status codes a GATT server answers requests with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    RequestNotSupported,
    Failure,
}

// ----------------------------------------------------------------------------
// Advertisement
// ----------------------------------------------------------------------------

/// What a peripheral broadcasts so centrals can find this installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub service_uuid: Uuid,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub connectable: bool,
    pub include_device_name: bool,
}

impl AdvertisementData {
    /// Advertisement for the message service carrying `device_id`
    pub fn for_device(device_id: &str) -> Self {
        let mut service_data = HashMap::new();
        service_data.insert(SERVICE_DATA_UUID, encode_identity_payload(device_id));
        Self {
            service_uuid: SERVICE_UUID,
            service_data,
            connectable: true,
            include_device_name: false,
        }
    }
}

/// A raw scan result as reported by a central transport
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

impl Advertisement {
    /// The advertiser's device identifier, if the payload carries one
    pub fn peer_id(&self) -> Option<String> {
        self.service_data
            .get(&SERVICE_DATA_UUID)
            .and_then(|payload| decode_identity_payload(payload))
    }
}

/// Encode a device identifier as advertisement service data
pub fn encode_identity_payload(device_id: &str) -> Vec<u8> {
    device_id.as_bytes().to_vec()
}

/// Decode advertisement service data into a device identifier
///
/// Empty and non-UTF-8 payloads carry no identity.
pub fn decode_identity_payload(payload: &[u8]) -> Option<String> {
    match std::str::from_utf8(payload) {
        Ok(id) if !id.is_empty() => Some(id.to_string()),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Encode outbound text as the raw characteristic payload
pub fn encode_message(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

/// Decode an inbound payload for the host; payloads are carried unmodified
/// up to this point
pub fn decode_message(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
