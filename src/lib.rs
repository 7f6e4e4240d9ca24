//! Session controller for the RoboRoach stimulation backpack.
//!
//! [`SessionService::spawn`] starts a session over any [`DeviceLink`] and
//! hands back a [`SessionHandle`]. Gesture input is turned into movement
//! commands by [`GestureTranslator`] and sent through the same handle.

pub mod domain;
pub mod infrastructure;

pub use domain::errors::{LinkError, ProtocolError, SessionError, ValidationError};
pub use domain::gestures::{DragSample, GestureInput, GestureTranslator};
pub use domain::models::{
    CommandId, CommandKind, ConnectionState, DeviceId, DeviceInfo, Direction, FailureReason,
    MovementCommand, SessionEvent,
};
pub use domain::settings::{Settings, SettingsService};
pub use domain::stimulation::{SafetyBounds, SettingField, StimulationSettings};
pub use infrastructure::bluetooth::{
    link_channel, ConnectionConfig, DeviceLink, LinkEvent, SessionHandle, SessionService,
    SessionSnapshot, SimulatedDevice,
};
