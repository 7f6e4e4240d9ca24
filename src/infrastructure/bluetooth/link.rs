//! Device Link Module
//!
//! The narrow seam between the session and a platform BLE central. Requests
//! are non-blocking: each returns as soon as the radio accepted it, and the
//! outcome arrives later as a [`LinkEvent`] on the channel the link was
//! built with.

use crate::domain::errors::LinkError;
use crate::domain::models::DeviceId;
use tokio::sync::mpsc;

/// Link-assigned handle of a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle(pub u16);

/// A characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: String,
    pub handle: CharacteristicHandle,
}

/// Callbacks from the link, delivered in order on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    DeviceFound {
        id: DeviceId,
        name: String,
        rssi: i16,
        service_uuids: Vec<String>,
    },
    Connected {
        id: DeviceId,
    },
    ConnectFailed {
        id: DeviceId,
        reason: String,
    },
    Disconnected {
        id: DeviceId,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    DiscoveryFailed {
        id: DeviceId,
        reason: String,
    },
    WriteComplete {
        characteristic: CharacteristicHandle,
        result: Result<(), LinkError>,
    },
    ReadComplete {
        characteristic: CharacteristicHandle,
        result: Result<Vec<u8>, LinkError>,
    },
    ValueChanged {
        characteristic: CharacteristicHandle,
        bytes: Vec<u8>,
    },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Channel a link implementation reports through.
pub fn link_channel() -> (LinkEventSender, LinkEventReceiver) {
    mpsc::unbounded_channel()
}

/// Platform BLE central as seen by the session.
pub trait DeviceLink: Send {
    /// Whether the radio exists and is powered.
    fn is_available(&self) -> bool;

    fn start_scan(&mut self, service_uuid: Option<&str>) -> Result<(), LinkError>;

    fn stop_scan(&mut self) -> Result<(), LinkError>;

    fn connect(&mut self, id: &DeviceId) -> Result<(), LinkError>;

    fn disconnect(&mut self, id: &DeviceId) -> Result<(), LinkError>;

    fn discover(&mut self, id: &DeviceId, service_uuid: &str) -> Result<(), LinkError>;

    /// Enable value-changed notifications for a characteristic.
    fn subscribe(&mut self, characteristic: CharacteristicHandle) -> Result<(), LinkError>;

    fn write(&mut self, characteristic: CharacteristicHandle, bytes: &[u8])
        -> Result<(), LinkError>;

    fn read(&mut self, characteristic: CharacteristicHandle) -> Result<(), LinkError>;
}
