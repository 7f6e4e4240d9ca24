//! BLE Connection Module
//!
//! The Connection State Machine: owns the lifecycle of one device session
//! and the serialized operation queue in front of it.
//!
//! The machine is synchronous. Callers pass the current time in, feed it
//! [`LinkEvent`]s one at a time, wake it at [`next_deadline`] and collect
//! what happened with [`drain`]. The session actor in `service.rs` is the
//! only production caller.
//!
//! [`next_deadline`]: ConnectionStateMachine::next_deadline
//! [`drain`]: ConnectionStateMachine::drain

use crate::domain::errors::{LinkError, ProtocolError, SessionError};
use crate::domain::models::{
    CommandId, CommandKind, ConnectionState, DeviceId, DeviceInfo, FailureReason,
    MovementCommand, ScannedDevice, SessionEvent,
};
use crate::domain::settings::{BleSettings, Settings};
use crate::domain::stimulation::{SafetyBounds, StimulationSettings};
use crate::infrastructure::bluetooth::link::{
    CharacteristicHandle, DeviceLink, DiscoveredCharacteristic, LinkEvent,
};
use crate::infrastructure::bluetooth::protocol::{self, Ack, DeviceFrame, StimulationCodec};
use crate::infrastructure::bluetooth::scanner::{BleScanner, ScanDecision};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service and characteristic UUIDs plus the scan filter
    pub ble: BleSettings,
    /// How long a scan may run without finding a device
    pub scan_timeout: Duration,
    /// Budget for Connecting plus DiscoveringServices
    pub connect_timeout: Duration,
    /// Budget for one write or read to be answered
    pub operation_timeout: Duration,
    /// How long to wait for the link to confirm a disconnect
    pub disconnect_timeout: Duration,
    /// Queued operations allowed behind the one in flight
    pub max_queued_operations: usize,
    /// Consecutive undecodable frames before the link is dropped
    pub malformed_frame_limit: u32,
    pub safety_bounds: SafetyBounds,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ConnectionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            ble: settings.ble.clone(),
            scan_timeout: Duration::from_millis(settings.timeouts.scan_ms),
            connect_timeout: Duration::from_millis(settings.timeouts.connect_ms),
            operation_timeout: Duration::from_millis(settings.timeouts.operation_ms),
            disconnect_timeout: Duration::from_millis(settings.timeouts.disconnect_ms),
            max_queued_operations: settings.max_queued_operations,
            malformed_frame_limit: settings.malformed_frame_limit.max(1),
            safety_bounds: settings.safety_bounds,
        }
    }
}

/// One unit of work for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Movement(MovementCommand),
    WriteSettings(StimulationSettings),
    ReadSettings,
}

impl Operation {
    pub fn kind(&self) -> CommandKind {
        match self {
            Operation::Movement(_) => CommandKind::Movement,
            Operation::WriteSettings(_) => CommandKind::WriteSettings,
            Operation::ReadSettings => CommandKind::ReadSettings,
        }
    }

    /// Opcode the device echoes in its acknowledgement. Reads are answered
    /// by the GATT read itself.
    fn acked_opcode(&self) -> Option<u8> {
        match self {
            Operation::Movement(_) => Some(protocol::opcode::MOVEMENT),
            Operation::WriteSettings(_) => Some(protocol::opcode::WRITE_SETTINGS),
            Operation::ReadSettings => None,
        }
    }
}

/// Results the session actor has to act on, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Publish as-is.
    Event(SessionEvent),
    /// The device acknowledged a settings write.
    SettingsWritten {
        id: CommandId,
        settings: StimulationSettings,
    },
    /// A settings write failed or was cancelled.
    SettingsWriteAbandoned { id: CommandId },
    /// A settings read returned.
    SettingsRead {
        id: CommandId,
        settings: StimulationSettings,
    },
    /// The device session is gone; link-scoped state must be reset.
    SessionEnded,
}

#[derive(Debug, Clone, Copy)]
struct PendingOperation {
    id: CommandId,
    operation: Operation,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: CommandId,
    operation: Operation,
    sequence: u8,
    deadline: Instant,
}

/// Characteristics of the connected device.
#[derive(Debug, Clone)]
struct DeviceSession {
    id: DeviceId,
    command: CharacteristicHandle,
    status: CharacteristicHandle,
}

fn setup_failure(err: LinkError) -> (FailureReason, SessionError) {
    match err {
        LinkError::Unavailable => (FailureReason::LinkUnavailable, SessionError::LinkUnavailable),
        other => (
            FailureReason::ConnectionFailed(other.to_string()),
            SessionError::ConnectionFailed(other.to_string()),
        ),
    }
}

pub struct ConnectionStateMachine<L: DeviceLink> {
    link: L,
    config: ConnectionConfig,
    codec: StimulationCodec,
    scanner: BleScanner,
    state: ConnectionState,
    target: Option<DeviceId>,
    session: Option<DeviceSession>,
    queue: VecDeque<PendingOperation>,
    in_flight: Option<InFlight>,
    state_deadline: Option<Instant>,
    next_command_id: u64,
    next_sequence: u8,
    malformed_run: u32,
    device_info: DeviceInfo,
    outbox: Vec<Output>,
}

impl<L: DeviceLink> ConnectionStateMachine<L> {
    pub fn new(link: L, config: ConnectionConfig) -> Self {
        Self {
            codec: StimulationCodec::new(config.safety_bounds),
            scanner: BleScanner::new(config.ble.clone()),
            link,
            config,
            state: ConnectionState::Idle,
            target: None,
            session: None,
            queue: VecDeque::new(),
            in_flight: None,
            state_deadline: None,
            next_command_id: 1,
            next_sequence: 1,
            malformed_run: 0,
            device_info: DeviceInfo::default(),
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Device of the live or in-progress connection.
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.session
            .as_ref()
            .map(|session| &session.id)
            .or(self.target.as_ref())
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    pub fn queued_operations(&self) -> usize {
        self.queue.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Matching devices seen by the current or last scan, strongest first.
    pub fn scanned_devices(&self) -> Vec<ScannedDevice> {
        self.scanner.devices()
    }

    /// Take everything produced since the last call.
    pub fn drain(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outbox)
    }

    /// Earliest time [`poll_timeouts`](Self::poll_timeouts) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let operation = self.in_flight.as_ref().map(|f| f.deadline);
        match (self.state_deadline, operation) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Start looking for a stimulation device.
    pub fn scan(&mut self, now: Instant) -> Result<ConnectionState, SessionError> {
        if !self.state.can_start() {
            debug!("scan() ignored in state {}", self.state);
            return Ok(self.state.clone());
        }
        self.ensure_link_available()?;
        self.start_scanning(None, now)?;
        Ok(self.state.clone())
    }

    /// Connect straight to a known device, or retarget a running scan.
    pub fn connect(&mut self, id: DeviceId, now: Instant) -> Result<ConnectionState, SessionError> {
        match self.state.clone() {
            ConnectionState::Connecting
            | ConnectionState::DiscoveringServices
            | ConnectionState::Ready => {
                debug!("connect() ignored in state {}", self.state);
            }
            ConnectionState::Scanning => {
                if let ScanDecision::Connect(device) = self.scanner.retarget(id) {
                    self.stop_scanning();
                    self.begin_connect(device.id, now)?;
                }
            }
            ConnectionState::Disconnecting => {
                return Err(SessionError::NotReady(ConnectionState::Disconnecting));
            }
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                self.ensure_link_available()?;
                self.begin_connect(id, now)?;
            }
        }
        Ok(self.state.clone())
    }

    /// Tear the connection down, or abandon a scan.
    pub fn disconnect(&mut self, now: Instant) -> ConnectionState {
        match self.state.clone() {
            ConnectionState::Scanning => {
                self.stop_scanning();
                self.state_deadline = None;
                self.set_state(ConnectionState::Idle);
            }
            ConnectionState::Connecting
            | ConnectionState::DiscoveringServices
            | ConnectionState::Ready => self.begin_disconnect(now),
            _ => debug!("disconnect() ignored in state {}", self.state),
        }
        self.state.clone()
    }

    pub fn send_command(
        &mut self,
        command: MovementCommand,
        now: Instant,
    ) -> Result<CommandId, SessionError> {
        self.enqueue(Operation::Movement(command), now)
    }

    pub fn write_settings(
        &mut self,
        settings: StimulationSettings,
        now: Instant,
    ) -> Result<CommandId, SessionError> {
        self.ensure_ready()?;
        self.codec.bounds().validate(&settings)?;
        self.enqueue(Operation::WriteSettings(settings), now)
    }

    pub fn read_settings(&mut self, now: Instant) -> Result<CommandId, SessionError> {
        self.enqueue(Operation::ReadSettings, now)
    }

    /// Cancel everything and release the link. The machine stays usable.
    pub fn shutdown(&mut self) {
        info!("Shutting down session in state {}", self.state);
        self.cancel_all();
        self.state_deadline = None;
        self.stop_scanning();
        if let Some(id) = self.device_id().cloned() {
            if let Err(e) = self.link.disconnect(&id) {
                warn!("Disconnect during shutdown failed: {}", e);
            }
        }
        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed(_) => {}
            ConnectionState::Scanning => self.set_state(ConnectionState::Idle),
            _ => self.finish_disconnect(),
        }
    }

    // ------------------------------------------------------------------
    // Link events and timers
    // ------------------------------------------------------------------

    pub fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        trace!("Link event: {:?}", event);
        match event {
            LinkEvent::DeviceFound {
                id,
                name,
                rssi,
                service_uuids,
            } => self.on_device_found(id, &name, rssi, &service_uuids, now),
            LinkEvent::Connected { id } => self.on_connected(id),
            LinkEvent::ConnectFailed { id, reason } => {
                if self.state == ConnectionState::Connecting && self.is_current(&id) {
                    error!("Connection to {} failed: {}", id, reason);
                    self.fail(
                        FailureReason::ConnectionFailed(reason.clone()),
                        SessionError::ConnectionFailed(reason),
                    );
                }
            }
            LinkEvent::CharacteristicsDiscovered {
                id,
                characteristics,
            } => self.on_characteristics(id, &characteristics, now),
            LinkEvent::DiscoveryFailed { id, reason } => {
                if self.state == ConnectionState::DiscoveringServices && self.is_current(&id) {
                    self.abort_setup(
                        FailureReason::DiscoveryFailed(reason.clone()),
                        SessionError::ConnectionFailed(reason),
                    );
                }
            }
            LinkEvent::Disconnected { id } => self.on_disconnected(id),
            LinkEvent::WriteComplete {
                characteristic,
                result,
            } => self.on_write_complete(characteristic, result),
            LinkEvent::ReadComplete {
                characteristic,
                result,
            } => self.on_read_complete(characteristic, result, now),
            LinkEvent::ValueChanged {
                characteristic,
                bytes,
            } => self.on_value_changed(characteristic, &bytes, now),
        }
        self.pump(now);
    }

    /// Expire whatever deadline has passed.
    pub fn poll_timeouts(&mut self, now: Instant) {
        if self.state_deadline.is_some_and(|deadline| now >= deadline) {
            self.state_deadline = None;
            match self.state.clone() {
                ConnectionState::Scanning => {
                    warn!("Scan timed out without finding a device");
                    self.stop_scanning();
                    self.set_state(ConnectionState::Idle);
                    self.emit(SessionEvent::Error(SessionError::DeviceNotFound));
                }
                ConnectionState::Connecting | ConnectionState::DiscoveringServices => {
                    warn!("Connection attempt timed out in state {}", self.state);
                    self.abort_setup(
                        FailureReason::Timeout,
                        SessionError::ConnectionFailed("connection attempt timed out".to_string()),
                    );
                }
                ConnectionState::Disconnecting => {
                    warn!("Link never confirmed the disconnect");
                    self.finish_disconnect();
                }
                _ => {}
            }
        }

        if self.in_flight.is_some_and(|f| now >= f.deadline) {
            if let Some(expired) = self.in_flight.take() {
                warn!(
                    "{:?} {:?} timed out (seq {})",
                    expired.operation.kind(),
                    expired.id,
                    expired.sequence
                );
                self.fail_and_discard(expired.id, expired.operation, SessionError::WriteTimeout);
            }
        }
        self.pump(now);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn ensure_link_available(&mut self) -> Result<(), SessionError> {
        if self.link.is_available() {
            return Ok(());
        }
        self.fail(FailureReason::LinkUnavailable, SessionError::LinkUnavailable);
        Err(SessionError::LinkUnavailable)
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.state == ConnectionState::Ready {
            Ok(())
        } else {
            debug!("Rejecting operation: session is {}", self.state);
            Err(SessionError::NotReady(self.state.clone()))
        }
    }

    fn start_scanning(&mut self, target: Option<DeviceId>, now: Instant) -> Result<(), SessionError> {
        if let Err(e) = self.scanner.start(&mut self.link, target) {
            let (reason, err) = setup_failure(e);
            self.fail(reason, err.clone());
            return Err(err);
        }
        self.set_state(ConnectionState::Scanning);
        self.state_deadline = Some(now + self.config.scan_timeout);
        Ok(())
    }

    fn stop_scanning(&mut self) {
        if let Err(e) = self.scanner.stop(&mut self.link) {
            warn!("Failed to stop scan: {}", e);
        }
    }

    fn begin_connect(&mut self, id: DeviceId, now: Instant) -> Result<(), SessionError> {
        info!("Connecting to device: {}", id);
        self.target = Some(id.clone());
        self.malformed_run = 0;
        self.device_info = DeviceInfo::default();

        if let Err(e) = self.link.connect(&id) {
            let (reason, err) = setup_failure(e);
            self.fail(reason, err.clone());
            return Err(err);
        }
        self.set_state(ConnectionState::Connecting);
        self.state_deadline = Some(now + self.config.connect_timeout);
        Ok(())
    }

    fn begin_disconnect(&mut self, now: Instant) {
        self.set_state(ConnectionState::Disconnecting);
        self.cancel_all();
        self.state_deadline = Some(now + self.config.disconnect_timeout);

        let Some(id) = self.device_id().cloned() else {
            self.finish_disconnect();
            return;
        };
        info!("Disconnecting from {}", id);
        if let Err(e) = self.link.disconnect(&id) {
            warn!("Disconnect request failed: {}", e);
            self.finish_disconnect();
        }
    }

    fn finish_disconnect(&mut self) {
        self.cancel_all();
        self.session = None;
        self.target = None;
        self.state_deadline = None;
        self.set_state(ConnectionState::Disconnected);
        self.outbox.push(Output::SessionEnded);
    }

    /// Give up on a connection attempt that got as far as the link.
    fn abort_setup(&mut self, reason: FailureReason, error: SessionError) {
        if let Some(id) = self.target.clone() {
            if let Err(e) = self.link.disconnect(&id) {
                warn!("Disconnect after failed setup failed: {}", e);
            }
        }
        self.fail(reason, error);
    }

    fn fail(&mut self, reason: FailureReason, error: SessionError) {
        error!("Session failed: {}", reason);
        self.cancel_all();
        if self.scanner.is_scanning() {
            self.stop_scanning();
        }
        let had_session = self.session.take().is_some();
        let had_target = self.target.take().is_some();
        self.state_deadline = None;
        self.set_state(ConnectionState::Failed(reason));
        self.emit(SessionEvent::Error(error));
        if had_session || had_target {
            self.outbox.push(Output::SessionEnded);
        }
    }

    fn on_device_found(
        &mut self,
        id: DeviceId,
        name: &str,
        rssi: i16,
        service_uuids: &[String],
        now: Instant,
    ) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        match self.scanner.on_advertisement(id, name, rssi, service_uuids) {
            ScanDecision::Ignore => {}
            ScanDecision::Report(device) => {
                info!("Found device: {} ({} dBm)", device.name, device.signal_strength);
                self.emit(SessionEvent::DeviceFound(device));
            }
            ScanDecision::Connect(device) => {
                info!("Found device: {} ({} dBm)", device.name, device.signal_strength);
                let id = device.id.clone();
                self.emit(SessionEvent::DeviceFound(device));
                self.stop_scanning();
                // Failure is already reported through events.
                let _ = self.begin_connect(id, now);
            }
        }
    }

    fn on_connected(&mut self, id: DeviceId) {
        if self.state != ConnectionState::Connecting || !self.is_current(&id) {
            debug!("Ignoring link-up for {} in state {}", id, self.state);
            return;
        }
        info!("Device connected: {}", id);
        self.set_state(ConnectionState::DiscoveringServices);
        if let Err(e) = self.link.discover(&id, &self.config.ble.service_uuid) {
            self.abort_setup(
                FailureReason::DiscoveryFailed(e.to_string()),
                SessionError::ConnectionFailed(e.to_string()),
            );
        }
    }

    fn on_characteristics(
        &mut self,
        id: DeviceId,
        characteristics: &[DiscoveredCharacteristic],
        now: Instant,
    ) {
        if self.state != ConnectionState::DiscoveringServices || !self.is_current(&id) {
            return;
        }
        let find = |uuid: &str| {
            characteristics
                .iter()
                .find(|c| c.uuid.eq_ignore_ascii_case(uuid))
                .map(|c| c.handle)
        };
        let command = find(&self.config.ble.command_char_uuid);
        let status = find(&self.config.ble.status_char_uuid);

        let (command, status) = match (command, status) {
            (Some(command), Some(status)) => (command, status),
            (None, _) => {
                let reason = "command characteristic missing".to_string();
                return self.abort_setup(
                    FailureReason::DiscoveryFailed(reason.clone()),
                    SessionError::ConnectionFailed(reason),
                );
            }
            (_, None) => {
                let reason = "status characteristic missing".to_string();
                return self.abort_setup(
                    FailureReason::DiscoveryFailed(reason.clone()),
                    SessionError::ConnectionFailed(reason),
                );
            }
        };

        if let Err(e) = self.link.subscribe(status) {
            let reason = format!("could not subscribe to status: {}", e);
            return self.abort_setup(
                FailureReason::DiscoveryFailed(reason.clone()),
                SessionError::ConnectionFailed(reason),
            );
        }

        info!("Stimulation service ready on {}", id);
        self.session = Some(DeviceSession {
            id,
            command,
            status,
        });
        self.state_deadline = None;
        self.malformed_run = 0;
        self.set_state(ConnectionState::Ready);

        // The post-connect read goes ahead of anything else.
        if let Err(e) = self.enqueue(Operation::ReadSettings, now) {
            warn!("Could not queue post-connect read: {}", e);
        }
    }

    fn on_disconnected(&mut self, id: DeviceId) {
        if !self.is_current(&id) {
            debug!("Ignoring disconnect of {}", id);
            return;
        }
        match self.state {
            ConnectionState::Ready => {
                warn!("Connection to {} lost", id);
                self.set_state(ConnectionState::Disconnecting);
                self.finish_disconnect();
                self.emit(SessionEvent::Error(SessionError::ConnectionLost));
            }
            ConnectionState::Disconnecting => {
                info!("Disconnected from {}", id);
                self.finish_disconnect();
            }
            ConnectionState::Connecting | ConnectionState::DiscoveringServices => {
                self.fail(FailureReason::ConnectionLost, SessionError::ConnectionLost);
            }
            _ => {}
        }
    }

    fn is_current(&self, id: &DeviceId) -> bool {
        self.device_id() == Some(id)
    }

    // ------------------------------------------------------------------
    // Operation queue
    // ------------------------------------------------------------------

    fn enqueue(&mut self, operation: Operation, now: Instant) -> Result<CommandId, SessionError> {
        self.ensure_ready()?;

        if operation == Operation::ReadSettings {
            if let Some(existing) = self
                .queue
                .iter()
                .find(|p| p.operation == Operation::ReadSettings)
            {
                debug!("Read coalesced into {:?}", existing.id);
                return Ok(existing.id);
            }
        }

        // Only a movement that has not been sent yet may be replaced.
        let replace_at = match operation {
            Operation::Movement(_) => self
                .queue
                .iter()
                .position(|p| matches!(p.operation, Operation::Movement(_))),
            _ => None,
        };
        if replace_at.is_none() && self.queue.len() >= self.config.max_queued_operations {
            warn!(
                "Queue full ({} pending), rejecting {:?}",
                self.queue.len(),
                operation.kind()
            );
            return Err(SessionError::QueueFull);
        }

        let id = CommandId(self.next_command_id);
        self.next_command_id += 1;
        let pending = PendingOperation { id, operation };

        match replace_at {
            Some(index) => {
                let replaced = std::mem::replace(&mut self.queue[index], pending);
                debug!("Movement {:?} superseded by {:?}", replaced.id, id);
                self.emit(SessionEvent::CommandSuperseded { id: replaced.id });
            }
            None => self.queue.push_back(pending),
        }

        self.pump(now);
        Ok(id)
    }

    /// Send the next queued operation if nothing is in flight.
    fn pump(&mut self, now: Instant) {
        while self.in_flight.is_none() {
            let Some((command_handle, status_handle)) =
                self.session.as_ref().map(|s| (s.command, s.status))
            else {
                return;
            };
            let Some(next) = self.queue.pop_front() else {
                return;
            };

            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);

            let sent = match next.operation {
                Operation::Movement(command) => {
                    let frame = self.codec.encode_movement(sequence, &command);
                    self.link
                        .write(command_handle, &frame)
                        .map_err(SessionError::from)
                }
                Operation::WriteSettings(settings) => {
                    match self.codec.encode_settings(sequence, &settings) {
                        Ok(frame) => self
                            .link
                            .write(command_handle, &frame)
                            .map_err(SessionError::from),
                        Err(e) => Err(SessionError::Protocol(e)),
                    }
                }
                Operation::ReadSettings => {
                    self.link.read(status_handle).map_err(SessionError::from)
                }
            };

            match sent {
                Ok(()) => {
                    debug!(
                        "Sent {:?} {:?} (seq {})",
                        next.operation.kind(),
                        next.id,
                        sequence
                    );
                    self.in_flight = Some(InFlight {
                        id: next.id,
                        operation: next.operation,
                        sequence,
                        deadline: now + self.config.operation_timeout,
                    });
                }
                Err(error) => self.fail_and_discard(next.id, next.operation, error),
            }
        }
    }

    fn complete_ok(&mut self, done: InFlight) {
        debug!("{:?} {:?} completed", done.operation.kind(), done.id);
        match done.operation {
            Operation::Movement(command) => {
                self.emit(SessionEvent::MovementCommandIssued(command));
            }
            Operation::WriteSettings(settings) => {
                self.outbox.push(Output::SettingsWritten {
                    id: done.id,
                    settings,
                });
            }
            Operation::ReadSettings => {}
        }
        self.emit(SessionEvent::CommandCompleted {
            id: done.id,
            kind: done.operation.kind(),
        });
    }

    fn complete_failed(&mut self, id: CommandId, operation: Operation, error: SessionError) {
        warn!("{:?} {:?} failed: {}", operation.kind(), id, error);
        self.emit(SessionEvent::CommandFailed {
            id,
            kind: operation.kind(),
            error,
        });
        if let Operation::WriteSettings(_) = operation {
            self.outbox.push(Output::SettingsWriteAbandoned { id });
        }
    }

    /// A timed-out or failed transfer leaves the device state unknown, so
    /// nothing queued behind it is sent.
    fn fail_and_discard(&mut self, id: CommandId, operation: Operation, error: SessionError) {
        self.complete_failed(id, operation, error);
        if !self.queue.is_empty() {
            warn!("Discarding {} queued operation(s)", self.queue.len());
        }
        self.cancel_all();
    }

    /// Report every queued and in-flight operation as cancelled.
    fn cancel_all(&mut self) {
        let in_flight = self.in_flight.take().map(|f| PendingOperation {
            id: f.id,
            operation: f.operation,
        });
        let cancelled: Vec<PendingOperation> =
            in_flight.into_iter().chain(self.queue.drain(..)).collect();

        for pending in cancelled {
            info!("{:?} {:?} cancelled", pending.operation.kind(), pending.id);
            self.emit(SessionEvent::CommandCancelled {
                id: pending.id,
                kind: pending.operation.kind(),
            });
            if let Operation::WriteSettings(_) = pending.operation {
                self.outbox
                    .push(Output::SettingsWriteAbandoned { id: pending.id });
            }
        }
    }

    // ------------------------------------------------------------------
    // Device responses
    // ------------------------------------------------------------------

    fn on_write_complete(
        &mut self,
        characteristic: CharacteristicHandle,
        result: Result<(), LinkError>,
    ) {
        let Err(e) = result else {
            trace!("GATT write confirmed");
            return;
        };
        let is_ours = self.session.as_ref().is_some_and(|s| s.command == characteristic)
            && self
                .in_flight
                .is_some_and(|f| f.operation.acked_opcode().is_some());
        if !is_ours {
            debug!("Ignoring write failure on {:?}: {}", characteristic, e);
            return;
        }
        if let Some(done) = self.in_flight.take() {
            self.fail_and_discard(done.id, done.operation, SessionError::from(e));
        }
    }

    fn on_read_complete(
        &mut self,
        characteristic: CharacteristicHandle,
        result: Result<Vec<u8>, LinkError>,
        now: Instant,
    ) {
        let is_ours = self.session.as_ref().is_some_and(|s| s.status == characteristic)
            && self
                .in_flight
                .is_some_and(|f| f.operation == Operation::ReadSettings);
        if !is_ours {
            debug!("Ignoring read completion on {:?}", characteristic);
            return;
        }
        let Some(done) = self.in_flight.take() else {
            return;
        };

        match result {
            Ok(bytes) => match self.codec.decode(&bytes) {
                Ok(DeviceFrame::Settings(settings)) => {
                    self.malformed_run = 0;
                    self.outbox.push(Output::SettingsRead {
                        id: done.id,
                        settings,
                    });
                    self.complete_ok(done);
                }
                Ok(other) => {
                    debug!("Read returned {:?} instead of settings", other);
                    self.complete_failed(
                        done.id,
                        done.operation,
                        SessionError::Protocol(ProtocolError::Malformed(
                            "expected a settings report",
                        )),
                    );
                }
                Err(e) => {
                    self.complete_failed(done.id, done.operation, SessionError::Protocol(e.clone()));
                    self.protocol_warning(e, now);
                }
            },
            Err(e) => self.fail_and_discard(done.id, done.operation, SessionError::from(e)),
        }
    }

    fn on_value_changed(&mut self, characteristic: CharacteristicHandle, bytes: &[u8], now: Instant) {
        let is_status = self
            .session
            .as_ref()
            .is_some_and(|s| s.status == characteristic);
        if !is_status {
            trace!("Ignoring notification on {:?}", characteristic);
            return;
        }

        match self.codec.decode(bytes) {
            Ok(frame) => {
                self.malformed_run = 0;
                self.handle_device_frame(frame);
            }
            Err(e) => self.protocol_warning(e, now),
        }
    }

    fn handle_device_frame(&mut self, frame: DeviceFrame) {
        match frame {
            DeviceFrame::Ack(ack) => self.handle_ack(ack),
            DeviceFrame::Battery(level) => {
                debug!("Battery level: {}%", level);
                self.device_info.battery_percent = Some(level);
                self.emit(SessionEvent::DeviceInfoUpdated(self.device_info.clone()));
            }
            DeviceFrame::Revision { hardware, firmware } => {
                self.device_info.hardware_revision = Some(format!("{}.{}", hardware.0, hardware.1));
                self.device_info.firmware_revision = Some(format!("{}.{}", firmware.0, firmware.1));
                self.emit(SessionEvent::DeviceInfoUpdated(self.device_info.clone()));
            }
            DeviceFrame::Settings(settings) => {
                debug!("Ignoring unsolicited settings report: {}", settings.describe());
            }
        }
    }

    fn handle_ack(&mut self, ack: Ack) {
        let expected = self.in_flight.is_some_and(|f| {
            f.sequence == ack.sequence && f.operation.acked_opcode() == Some(ack.opcode)
        });
        if !expected {
            debug!(
                "Ignoring ack for seq {} opcode {:#04X}",
                ack.sequence, ack.opcode
            );
            return;
        }
        let Some(done) = self.in_flight.take() else {
            return;
        };
        if ack.is_ok() {
            self.complete_ok(done);
        } else {
            self.fail_and_discard(
                done.id,
                done.operation,
                SessionError::WriteFailed(format!("device rejected frame (status {:#04X})", ack.status)),
            );
        }
    }

    fn protocol_warning(&mut self, error: ProtocolError, now: Instant) {
        self.malformed_run += 1;
        warn!(
            "Protocol error ({} in a row): {}",
            self.malformed_run, error
        );
        self.emit(SessionEvent::ProtocolWarning(error));

        if self.malformed_run >= self.config.malformed_frame_limit
            && self.state == ConnectionState::Ready
        {
            error!("Too many malformed frames, dropping the link");
            self.malformed_run = 0;
            self.emit(SessionEvent::Error(SessionError::ConnectionLost));
            self.begin_disconnect(now);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Connection state: {} -> {}", self.state, state);
            self.state = state.clone();
            self.emit(SessionEvent::ConnectionStateChanged(state));
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.outbox.push(Output::Event(event));
    }
}
