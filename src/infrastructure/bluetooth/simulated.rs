//! In-memory RoboRoach that speaks the wire protocol.
//!
//! Used by the `roboroach` binary and as the shared test double. Every
//! request is answered synchronously by pushing [`LinkEvent`]s onto the
//! channel, in the order a real central would report them.

use crate::domain::errors::LinkError;
use crate::domain::models::{DeviceId, MovementCommand};
use crate::domain::stimulation::{SafetyBounds, StimulationSettings};
use crate::infrastructure::bluetooth::link::{
    CharacteristicHandle, DeviceLink, DiscoveredCharacteristic, LinkEvent, LinkEventSender,
};
use crate::infrastructure::bluetooth::protocol::{
    self, Ack, DeviceFrame, HostFrame, StimulationCodec, ACK_OK, ACK_REJECTED,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

pub const SIMULATED_DEVICE_ID: &str = "SIM:RR:00:01";
pub const SIMULATED_DEVICE_NAME: &str = "RoboRoach";

pub const COMMAND_HANDLE: CharacteristicHandle = CharacteristicHandle(0x0010);
pub const STATUS_HANDLE: CharacteristicHandle = CharacteristicHandle(0x0012);

/// Knobs for scripting failure paths.
#[derive(Debug, Clone)]
pub struct SimulatedBehavior {
    pub radio_available: bool,
    pub advertise: bool,
    pub rssi: i16,
    /// When false, connect requests are accepted but never answered.
    pub answer_connect: bool,
    pub reject_connect: Option<String>,
    pub omit_status_characteristic: bool,
    /// When false, writes complete at the GATT level but are never acked.
    pub ack_writes: bool,
    pub reject_writes: bool,
    pub answer_reads: bool,
    pub confirm_disconnect: bool,
    /// When true, disconnect requests fail and the link stays up.
    pub refuse_disconnect: bool,
    /// Other advertisers in range: (id, name, service uuids).
    pub bystanders: Vec<(String, String, Vec<String>)>,
}

impl Default for SimulatedBehavior {
    fn default() -> Self {
        Self {
            radio_available: true,
            advertise: true,
            rssi: -58,
            answer_connect: true,
            reject_connect: None,
            omit_status_characteristic: false,
            ack_writes: true,
            reject_writes: false,
            answer_reads: true,
            confirm_disconnect: true,
            refuse_disconnect: false,
            bystanders: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    behavior: SimulatedBehavior,
    settings: StimulationSettings,
    battery_percent: u8,
    hardware: (u8, u8),
    firmware: (u8, u8),
    scanning: bool,
    connected: bool,
    subscribed: bool,
    writes: Vec<Vec<u8>>,
    reads: usize,
    movements: Vec<MovementCommand>,
}

/// Simulated stimulation backpack implementing [`DeviceLink`].
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
    events: LinkEventSender,
    codec: StimulationCodec,
    id: DeviceId,
}

/// Test-side view of a [`SimulatedDevice`] after it was handed to a session.
#[derive(Clone)]
pub struct SimulatorControl {
    state: Arc<Mutex<DeviceState>>,
    events: LinkEventSender,
    codec: StimulationCodec,
    id: DeviceId,
}

fn lock(state: &Mutex<DeviceState>) -> MutexGuard<'_, DeviceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Advertisements currently in range, filtered the way a central would.
fn advertisements(state: &DeviceState, id: &DeviceId, service_uuid: Option<&str>) -> Vec<LinkEvent> {
    let mut advertisers = Vec::new();
    for (other, name, uuids) in &state.behavior.bystanders {
        advertisers.push((DeviceId::new(other.as_str()), name.clone(), uuids.clone(), -80));
    }
    if state.behavior.advertise {
        advertisers.push((
            id.clone(),
            SIMULATED_DEVICE_NAME.to_string(),
            vec![protocol::SERVICE_UUID.to_string()],
            state.behavior.rssi,
        ));
    }

    advertisers
        .into_iter()
        .filter(|(_, _, service_uuids, _)| {
            service_uuid.map_or(true, |wanted| {
                service_uuids.iter().any(|u| u.eq_ignore_ascii_case(wanted))
            })
        })
        .map(|(id, name, service_uuids, rssi)| LinkEvent::DeviceFound {
            id,
            name,
            rssi,
            service_uuids,
        })
        .collect()
}

impl SimulatedDevice {
    pub fn new(events: LinkEventSender) -> Self {
        Self::with_behavior(events, SimulatedBehavior::default())
    }

    pub fn with_behavior(events: LinkEventSender, behavior: SimulatedBehavior) -> Self {
        let state = DeviceState {
            behavior,
            settings: StimulationSettings::default(),
            battery_percent: 87,
            hardware: (1, 2),
            firmware: (2, 0),
            scanning: false,
            connected: false,
            subscribed: false,
            writes: Vec::new(),
            reads: 0,
            movements: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            events,
            // The firmware enforces the same limits it ships with.
            codec: StimulationCodec::new(SafetyBounds::default()),
            id: DeviceId::new(SIMULATED_DEVICE_ID),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn control(&self) -> SimulatorControl {
        SimulatorControl {
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            codec: self.codec.clone(),
            id: self.id.clone(),
        }
    }

    fn emit(&self, event: LinkEvent) {
        trace!("Simulator -> {:?}", event);
        let _ = self.events.send(event);
    }

    fn notify(&self, state: &DeviceState, frame: DeviceFrame) {
        if state.subscribed {
            let bytes = self.codec.encode_report(0, &frame).to_vec();
            self.emit(LinkEvent::ValueChanged {
                characteristic: STATUS_HANDLE,
                bytes,
            });
        }
    }

    fn handle_frame(&self, state: &mut DeviceState, bytes: &[u8]) {
        let (sequence, frame) = match self.codec.decode_request(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Simulator dropped frame: {}", e);
                return;
            }
        };

        let (opcode, accepted) = match frame {
            HostFrame::WriteSettings(settings) => {
                let accepted =
                    !state.behavior.reject_writes && self.codec.bounds().validate(&settings).is_ok();
                if accepted {
                    state.settings = settings;
                }
                (protocol::opcode::WRITE_SETTINGS, accepted)
            }
            HostFrame::Movement(command) => {
                let accepted = !state.behavior.reject_writes;
                if accepted {
                    debug!("Simulator stimulating: {:?}", command);
                    state.movements.push(command);
                }
                (protocol::opcode::MOVEMENT, accepted)
            }
        };

        if state.behavior.ack_writes {
            let ack = Ack {
                sequence,
                opcode,
                status: if accepted { ACK_OK } else { ACK_REJECTED },
            };
            self.notify(state, DeviceFrame::Ack(ack));
        }
    }
}

impl DeviceLink for SimulatedDevice {
    fn is_available(&self) -> bool {
        lock(&self.state).behavior.radio_available
    }

    fn start_scan(&mut self, service_uuid: Option<&str>) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if !state.behavior.radio_available {
            return Err(LinkError::Unavailable);
        }
        state.scanning = true;

        for event in advertisements(&state, &self.id, service_uuid) {
            self.emit(event);
        }
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), LinkError> {
        lock(&self.state).scanning = false;
        Ok(())
    }

    fn connect(&mut self, id: &DeviceId) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if !state.behavior.radio_available {
            return Err(LinkError::Unavailable);
        }
        if *id != self.id {
            return Err(LinkError::UnknownDevice(id.to_string()));
        }
        if !state.behavior.answer_connect {
            debug!("Simulator ignoring connect request");
            return Ok(());
        }
        if let Some(reason) = state.behavior.reject_connect.clone() {
            self.emit(LinkEvent::ConnectFailed {
                id: id.clone(),
                reason,
            });
            return Ok(());
        }
        state.connected = true;
        self.emit(LinkEvent::Connected { id: id.clone() });
        Ok(())
    }

    fn disconnect(&mut self, id: &DeviceId) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if state.behavior.refuse_disconnect {
            return Err(LinkError::Gatt("disconnect refused".to_string()));
        }
        state.connected = false;
        state.subscribed = false;
        if state.behavior.confirm_disconnect {
            self.emit(LinkEvent::Disconnected { id: id.clone() });
        }
        Ok(())
    }

    fn discover(&mut self, id: &DeviceId, service_uuid: &str) -> Result<(), LinkError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        if !service_uuid.eq_ignore_ascii_case(protocol::SERVICE_UUID) {
            self.emit(LinkEvent::DiscoveryFailed {
                id: id.clone(),
                reason: format!("service {} not present", service_uuid),
            });
            return Ok(());
        }

        let mut characteristics = vec![DiscoveredCharacteristic {
            uuid: protocol::COMMAND_CHAR_UUID.to_string(),
            handle: COMMAND_HANDLE,
        }];
        if !state.behavior.omit_status_characteristic {
            characteristics.push(DiscoveredCharacteristic {
                uuid: protocol::STATUS_CHAR_UUID.to_string(),
                handle: STATUS_HANDLE,
            });
        }
        self.emit(LinkEvent::CharacteristicsDiscovered {
            id: id.clone(),
            characteristics,
        });
        Ok(())
    }

    fn subscribe(&mut self, characteristic: CharacteristicHandle) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        if characteristic != STATUS_HANDLE {
            return Err(LinkError::Gatt("characteristic does not notify".to_string()));
        }
        state.subscribed = true;
        Ok(())
    }

    fn write(
        &mut self,
        characteristic: CharacteristicHandle,
        bytes: &[u8],
    ) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        if characteristic != COMMAND_HANDLE {
            return Err(LinkError::Gatt("characteristic is not writable".to_string()));
        }
        state.writes.push(bytes.to_vec());
        self.emit(LinkEvent::WriteComplete {
            characteristic,
            result: Ok(()),
        });
        self.handle_frame(&mut state, bytes);
        Ok(())
    }

    fn read(&mut self, characteristic: CharacteristicHandle) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        if characteristic != STATUS_HANDLE {
            return Err(LinkError::Gatt("characteristic is not readable".to_string()));
        }
        state.reads += 1;
        if !state.behavior.answer_reads {
            return Ok(());
        }

        let report = self
            .codec
            .encode_report(0, &DeviceFrame::Settings(state.settings))
            .to_vec();
        self.emit(LinkEvent::ReadComplete {
            characteristic,
            result: Ok(report),
        });
        // Housekeeping follows every settings read.
        self.notify(&state, DeviceFrame::Battery(state.battery_percent));
        self.notify(
            &state,
            DeviceFrame::Revision {
                hardware: state.hardware,
                firmware: state.firmware,
            },
        );
        Ok(())
    }
}

impl SimulatorControl {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn update_behavior(&self, update: impl FnOnce(&mut SimulatedBehavior)) {
        update(&mut lock(&self.state).behavior);
    }

    /// Raw frames written to the command characteristic.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    pub fn read_count(&self) -> usize {
        lock(&self.state).reads
    }

    /// Movement commands the device accepted, in order.
    pub fn movements(&self) -> Vec<MovementCommand> {
        lock(&self.state).movements.clone()
    }

    pub fn settings(&self) -> StimulationSettings {
        lock(&self.state).settings
    }

    /// Change the settings as if someone adjusted the device directly.
    pub fn set_settings(&self, settings: StimulationSettings) {
        lock(&self.state).settings = settings;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    /// Advertise again while a scan is running.
    pub fn advertise(&self) {
        let state = lock(&self.state);
        if state.scanning {
            for event in advertisements(&state, &self.id, None) {
                let _ = self.events.send(event);
            }
        }
    }

    /// Drop the link from the device side.
    pub fn drop_link(&self) {
        let mut state = lock(&self.state);
        if state.connected {
            state.connected = false;
            state.subscribed = false;
            let _ = self.events.send(LinkEvent::Disconnected {
                id: self.id.clone(),
            });
        }
    }

    /// Push arbitrary bytes as a status notification.
    pub fn notify_raw(&self, bytes: &[u8]) {
        let _ = self.events.send(LinkEvent::ValueChanged {
            characteristic: STATUS_HANDLE,
            bytes: bytes.to_vec(),
        });
    }

    /// Report a new battery level.
    pub fn report_battery(&self, percent: u8) {
        let mut state = lock(&self.state);
        state.battery_percent = percent;
        if state.subscribed {
            let bytes = self
                .codec
                .encode_report(0, &DeviceFrame::Battery(percent))
                .to_vec();
            let _ = self.events.send(LinkEvent::ValueChanged {
                characteristic: STATUS_HANDLE,
                bytes,
            });
        }
    }
}
