//! Session Service Module
//!
//! Runs the connection state machine and the settings synchronizer inside
//! one tokio task. Everything that touches session state (API requests,
//! link callbacks and timer expiry) is handled one at a time in that task.

use crate::domain::errors::SessionError;
use crate::domain::models::{
    CommandId, ConnectionState, DeviceId, DeviceInfo, MovementCommand, ScannedDevice,
    SessionEvent,
};
use crate::domain::stimulation::{SettingField, StimulationSettings};
use crate::domain::synchronizer::SettingsSynchronizer;
use crate::infrastructure::bluetooth::connection::{
    ConnectionConfig, ConnectionStateMachine, Output,
};
use crate::infrastructure::bluetooth::link::{DeviceLink, LinkEventReceiver};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Events buffered per subscriber before it starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub device: Option<DeviceId>,
    pub draft: StimulationSettings,
    pub confirmed: Option<StimulationSettings>,
    pub has_unsaved_edits: bool,
    pub device_info: DeviceInfo,
    pub queued_operations: usize,
    /// Matching devices from the current or last scan, strongest first.
    pub scanned_devices: Vec<ScannedDevice>,
}

type Reply<T> = oneshot::Sender<T>;

enum SessionCommand {
    Scan(Reply<Result<ConnectionState, SessionError>>),
    Connect(DeviceId, Reply<Result<ConnectionState, SessionError>>),
    Disconnect(Reply<ConnectionState>),
    SendCommand(MovementCommand, Reply<Result<CommandId, SessionError>>),
    ApplyEdit(SettingField, i64, Reply<Result<(), SessionError>>),
    DiscardEdits(Reply<()>),
    Commit(Reply<Result<CommandId, SessionError>>),
    Refresh(Reply<Result<CommandId, SessionError>>),
    Snapshot(Reply<SessionSnapshot>),
    Shutdown(Reply<()>),
}

/// Cloneable front door to a running session.
///
/// Every request returns as soon as the session accepted or rejected it.
/// Outcomes arrive later as [`SessionEvent`]s on [`subscribe`](Self::subscribe).
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    pub async fn scan(&self) -> Result<ConnectionState, SessionError> {
        self.request(SessionCommand::Scan).await?
    }

    /// Connect to a known device. A no-op while connecting or connected.
    pub async fn connect(&self, id: DeviceId) -> Result<ConnectionState, SessionError> {
        self.request(|reply| SessionCommand::Connect(id, reply))
            .await?
    }

    pub async fn disconnect(&self) -> Result<ConnectionState, SessionError> {
        self.request(SessionCommand::Disconnect).await
    }

    /// Queue a movement command. Only accepted while `Ready`.
    pub async fn send_command(&self, command: MovementCommand) -> Result<CommandId, SessionError> {
        self.request(|reply| SessionCommand::SendCommand(command, reply))
            .await?
    }

    /// Edit one field of the draft settings.
    pub async fn apply_local_edit(&self, field: SettingField, value: i64) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::ApplyEdit(field, value, reply))
            .await?
    }

    pub async fn discard_edits(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::DiscardEdits).await
    }

    /// Write the draft settings to the device.
    pub async fn commit(&self) -> Result<CommandId, SessionError> {
        self.request(SessionCommand::Commit).await?
    }

    /// Read the settings back from the device.
    pub async fn refresh(&self) -> Result<CommandId, SessionError> {
        self.request(SessionCommand::Refresh).await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(SessionCommand::Snapshot).await
    }

    /// Cancel pending work, release the link and stop the session task.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Shutdown).await
    }
}

/// The session actor.
pub struct SessionService<L: DeviceLink> {
    machine: ConnectionStateMachine<L>,
    synchronizer: SettingsSynchronizer,
    events: broadcast::Sender<SessionEvent>,
}

impl<L: DeviceLink + 'static> SessionService<L> {
    /// Start a session task over `link`. `link_events` must be the receiving
    /// end of the channel the link reports through.
    pub fn spawn(
        link: L,
        link_events: LinkEventReceiver,
        config: ConnectionConfig,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let service = Self {
            synchronizer: SettingsSynchronizer::new(config.safety_bounds),
            machine: ConnectionStateMachine::new(link, config),
            events: event_tx.clone(),
        };
        let task = tokio::spawn(service.run(command_rx, link_events));

        (
            SessionHandle {
                commands: command_tx,
                events: event_tx,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut link_events: LinkEventReceiver,
    ) {
        info!("Session task started");
        loop {
            let deadline = self.machine.next_deadline();
            tokio::select! {
                biased;

                event = link_events.recv() => match event {
                    Some(event) => self.machine.handle_link_event(event, Instant::now()),
                    None => {
                        warn!("Link event channel closed");
                        self.machine.shutdown();
                        break;
                    }
                },
                _ = wait_until(deadline) => self.machine.poll_timeouts(Instant::now()),
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown(reply)) => {
                        self.machine.shutdown();
                        self.publish();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("Every session handle dropped");
                        self.machine.shutdown();
                        break;
                    }
                },
            }
            self.publish();
        }
        self.publish();
        info!("Session task stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        let now = Instant::now();
        match command {
            SessionCommand::Scan(reply) => {
                let _ = reply.send(self.machine.scan(now));
            }
            SessionCommand::Connect(id, reply) => {
                let _ = reply.send(self.machine.connect(id, now));
            }
            SessionCommand::Disconnect(reply) => {
                let _ = reply.send(self.machine.disconnect(now));
            }
            SessionCommand::SendCommand(command, reply) => {
                let command = self.synchronizer.cap_movement(command);
                let _ = reply.send(self.machine.send_command(command, now));
            }
            SessionCommand::ApplyEdit(field, value, reply) => {
                let result = self
                    .synchronizer
                    .apply_local_edit(field, value)
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            SessionCommand::DiscardEdits(reply) => {
                self.synchronizer.discard_edits();
                let _ = reply.send(());
            }
            SessionCommand::Commit(reply) => {
                let _ = reply.send(self.commit(now));
            }
            SessionCommand::Refresh(reply) => {
                let _ = reply.send(self.machine.read_settings(now));
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown(reply) => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn commit(&mut self, now: Instant) -> Result<CommandId, SessionError> {
        let snapshot = self.synchronizer.prepare_commit()?;
        let id = self.machine.write_settings(snapshot, now)?;
        info!("Committing settings: {}", snapshot.describe());
        self.synchronizer.commit_started(id);
        Ok(id)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.machine.state().clone(),
            device: self.machine.device_id().cloned(),
            draft: *self.synchronizer.draft(),
            confirmed: self.synchronizer.confirmed().copied(),
            has_unsaved_edits: self.synchronizer.is_dirty(),
            device_info: self.machine.device_info().clone(),
            queued_operations: self.machine.queued_operations(),
            scanned_devices: self.machine.scanned_devices(),
        }
    }

    /// Route state machine output through the synchronizer and out to
    /// subscribers, preserving order.
    fn publish(&mut self) {
        for output in self.machine.drain() {
            match output {
                Output::Event(event) => self.emit(event),
                Output::SettingsWritten { id, settings } => {
                    let event = self.synchronizer.commit_acknowledged(id, settings);
                    self.emit(event);
                }
                Output::SettingsWriteAbandoned { id } => self.synchronizer.commit_failed(id),
                Output::SettingsRead { settings, .. } => {
                    for event in self.synchronizer.refresh_completed(settings) {
                        self.emit(event);
                    }
                }
                Output::SessionEnded => self.synchronizer.link_reset(),
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        debug!("Session event: {:?}", event);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{CommandKind, FailureReason};
    use crate::infrastructure::bluetooth::link::link_channel;
    use crate::infrastructure::bluetooth::simulated::{
        SimulatedBehavior, SimulatedDevice, SimulatorControl, SIMULATED_DEVICE_ID,
    };
    use std::time::Duration;

    fn start(behavior: SimulatedBehavior) -> (SessionHandle, SimulatorControl, JoinHandle<()>) {
        let (tx, rx) = link_channel();
        let device = SimulatedDevice::with_behavior(tx, behavior);
        let control = device.control();
        let (handle, task) = SessionService::spawn(device, rx, ConnectionConfig::default());
        (handle, control, task)
    }

    /// Collect events until one matches `done`, inclusive.
    async fn collect_until(
        events: &mut broadcast::Receiver<SessionEvent>,
        done: impl Fn(&SessionEvent) -> bool,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            let finished = done(&event);
            seen.push(event);
            if finished {
                return seen;
            }
        }
    }

    async fn connected() -> (
        SessionHandle,
        SimulatorControl,
        broadcast::Receiver<SessionEvent>,
    ) {
        let (handle, control, _task) = start(SimulatedBehavior::default());
        let mut events = handle.subscribe();
        handle
            .connect(DeviceId::new(SIMULATED_DEVICE_ID))
            .await
            .unwrap();
        collect_until(&mut events, |e| matches!(e, SessionEvent::CommandCompleted { .. })).await;
        (handle, control, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_complete_is_first_event_after_ready() {
        let (handle, _control, _task) = start(SimulatedBehavior::default());
        let mut events = handle.subscribe();

        assert_eq!(handle.scan().await.unwrap(), ConnectionState::Scanning);
        let seen = collect_until(&mut events, |e| *e == SessionEvent::SettingsReadComplete).await;

        let ready = seen
            .iter()
            .position(|e| *e == SessionEvent::ConnectionStateChanged(ConnectionState::Ready))
            .unwrap();
        assert_eq!(ready + 2, seen.len());
        assert_eq!(seen[ready + 1], SessionEvent::SettingsReadComplete);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SettingsChanged(StimulationSettings::default())
        );

        let snapshot = handle.snapshot().await.unwrap();
        let found: Vec<DeviceId> = snapshot.scanned_devices.into_iter().map(|d| d.id).collect();
        assert_eq!(found, vec![DeviceId::new(SIMULATED_DEVICE_ID)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_movement_capped_and_issued() {
        let (handle, control, mut events) = connected().await;

        handle.send_command(MovementCommand::left(5_000)).await.unwrap();
        let seen = collect_until(&mut events, |e| {
            matches!(e, SessionEvent::MovementCommandIssued(_))
        })
        .await;
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::MovementCommandIssued(MovementCommand::left(1_000)))
        );
        assert_eq!(control.movements(), vec![MovementCommand::left(1_000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_before_connect_is_rejected() {
        let (handle, control, _task) = start(SimulatedBehavior::default());
        assert_eq!(
            handle.send_command(MovementCommand::right(200)).await,
            Err(SessionError::NotReady(ConnectionState::Idle))
        );
        assert!(control.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_edit_rejected_without_mutation() {
        let (handle, control, _events) = connected().await;
        let before = handle.snapshot().await.unwrap();

        let err = handle
            .apply_local_edit(SettingField::PulseWidth, 60_000)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(v) if v.field == SettingField::PulseWidth));

        let after = handle.snapshot().await.unwrap();
        assert_eq!(after.draft, before.draft);
        assert!(!after.has_unsaved_edits);
        assert!(control.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_updates_confirmed_settings() {
        let (handle, control, mut events) = connected().await;

        handle.apply_local_edit(SettingField::Gain, 65).await.unwrap();
        handle.apply_local_edit(SettingField::Duration, 400).await.unwrap();
        handle.commit().await.unwrap();

        let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::SettingsChanged(_))).await;
        let SessionEvent::SettingsChanged(settings) = seen.last().unwrap().clone() else {
            unreachable!();
        };
        assert_eq!(settings.gain_percent, 65);
        assert_eq!(settings.duration_ms, 400);
        assert_eq!(control.settings(), settings);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.confirmed, Some(settings));
        assert!(!snapshot.has_unsaved_edits);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_commit_keeps_draft() {
        let (handle, control, mut events) = connected().await;
        control.update_behavior(|b| b.reject_writes = true);

        handle.apply_local_edit(SettingField::Gain, 10).await.unwrap();
        let id = handle.commit().await.unwrap();
        collect_until(&mut events, |e| {
            matches!(e, SessionEvent::CommandFailed { id: failed, .. } if *failed == id)
        })
        .await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.confirmed, Some(StimulationSettings::default()));
        assert_eq!(snapshot.draft.gain_percent, 10);
        assert!(snapshot.has_unsaved_edits);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_fires_settings_changed_once() {
        let (handle, _control, mut events) = connected().await;
        // Drain the housekeeping reports of the first read.
        collect_until(&mut events, |e| {
            matches!(e, SessionEvent::DeviceInfoUpdated(info) if info.firmware_revision.is_some())
        })
        .await;

        let id = handle.refresh().await.unwrap();
        let seen = collect_until(&mut events, |e| {
            *e == SessionEvent::CommandCompleted {
                id,
                kind: CommandKind::ReadSettings,
            }
        })
        .await;
        assert_eq!(
            seen,
            vec![
                SessionEvent::SettingsChanged(StimulationSettings::default()),
                SessionEvent::CommandCompleted {
                    id,
                    kind: CommandKind::ReadSettings
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_fails_with_timeout() {
        let (handle, _control, _task) = start(SimulatedBehavior {
            answer_connect: false,
            ..Default::default()
        });
        let mut events = handle.subscribe();
        handle.scan().await.unwrap();

        let started = Instant::now();
        let seen = collect_until(&mut events, |e| {
            matches!(e, SessionEvent::ConnectionStateChanged(ConnectionState::Failed(_)))
        })
        .await;
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::ConnectionStateChanged(ConnectionState::Failed(
                FailureReason::Timeout
            )))
        );
        assert!(!seen.contains(&SessionEvent::ConnectionStateChanged(ConnectionState::Ready)));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_surfaces_as_command_failure() {
        let (handle, control, mut events) = connected().await;
        control.update_behavior(|b| b.ack_writes = false);

        let id = handle.send_command(MovementCommand::right(300)).await.unwrap();
        let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::CommandFailed { .. })).await;
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::CommandFailed {
                id,
                kind: CommandKind::Movement,
                error: SessionError::WriteTimeout
            })
        );
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_and_closes() {
        let (handle, control, mut events) = connected().await;
        control.update_behavior(|b| b.ack_writes = false);
        let id = handle.send_command(MovementCommand::left(300)).await.unwrap();

        handle.shutdown().await.unwrap();
        let seen = collect_until(&mut events, |e| {
            matches!(e, SessionEvent::CommandCancelled { .. })
        })
        .await;
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::CommandCancelled {
                id,
                kind: CommandKind::Movement
            })
        );
        assert!(!control.is_connected());
        assert_eq!(handle.scan().await, Err(SessionError::SessionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_link_drop() {
        let (handle, control, mut events) = connected().await;
        control.drop_link();
        collect_until(&mut events, |e| {
            *e == SessionEvent::Error(SessionError::ConnectionLost)
        })
        .await;

        handle
            .connect(DeviceId::new(SIMULATED_DEVICE_ID))
            .await
            .unwrap();
        let seen = collect_until(&mut events, |e| *e == SessionEvent::SettingsReadComplete).await;
        assert!(seen.contains(&SessionEvent::ConnectionStateChanged(ConnectionState::Ready)));
    }
}
