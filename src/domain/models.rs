use crate::domain::errors::{ProtocolError, SessionError};
use crate::domain::stimulation::StimulationSettings;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the Bluetooth link assigned to a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned when the session accepts an operation. Results are
/// reported later through [`SessionEvent`]s carrying the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    None,
    Left,
    Right,
}

/// A discrete, time-bounded steering directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovementCommand {
    pub direction: Direction,
    pub duration_ms: u16,
}

impl MovementCommand {
    pub fn left(duration_ms: u16) -> Self {
        Self {
            direction: Direction::Left,
            duration_ms,
        }
    }

    pub fn right(duration_ms: u16) -> Self {
        Self {
            direction: Direction::Right,
            duration_ms,
        }
    }

    /// Straight ahead: no new stimulation, the device timer runs out on its own.
    pub fn none() -> Self {
        Self {
            direction: Direction::None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    LinkUnavailable,
    ConnectionFailed(String),
    DiscoveryFailed(String),
    ConnectionLost,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::LinkUnavailable => f.write_str("link unavailable"),
            FailureReason::ConnectionFailed(reason) => write!(f, "connection failed: {}", reason),
            FailureReason::DiscoveryFailed(reason) => write!(f, "discovery failed: {}", reason),
            FailureReason::ConnectionLost => f.write_str("connection lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnecting,
    Disconnected,
    Failed(FailureReason),
}

impl ConnectionState {
    /// Whether a connection attempt or live session is in progress.
    pub fn is_connecting_or_ready(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::Ready
        )
    }

    /// Whether `scan()`/`connect()` may start a new cycle from here.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("Idle"),
            ConnectionState::Scanning => f.write_str("Scanning"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::DiscoveringServices => f.write_str("DiscoveringServices"),
            ConnectionState::Ready => f.write_str("Ready"),
            ConnectionState::Disconnecting => f.write_str("Disconnecting"),
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// What a queued operation does on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Movement,
    WriteSettings,
    ReadSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub id: DeviceId,
    pub name: String,
    pub signal_strength: i16,
    pub advertises_service: bool,
}

/// Housekeeping values the device reports alongside its settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub battery_percent: Option<u8>,
    pub hardware_revision: Option<String>,
    pub firmware_revision: Option<String>,
}

/// Everything the session reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    DeviceFound(ScannedDevice),
    /// The post-connect settings read finished; the session is initialized.
    SettingsReadComplete,
    SettingsChanged(StimulationSettings),
    /// The device acknowledged a movement command.
    MovementCommandIssued(MovementCommand),
    CommandCompleted {
        id: CommandId,
        kind: CommandKind,
    },
    CommandFailed {
        id: CommandId,
        kind: CommandKind,
        error: SessionError,
    },
    CommandCancelled {
        id: CommandId,
        kind: CommandKind,
    },
    /// A queued movement was replaced by a newer one before it was sent.
    CommandSuperseded {
        id: CommandId,
    },
    ProtocolWarning(ProtocolError),
    DeviceInfoUpdated(DeviceInfo),
    Error(SessionError),
}
