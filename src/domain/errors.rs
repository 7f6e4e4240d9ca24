//! Error taxonomy for the stimulation session.
//!
//! Validation and readiness errors are synchronous rejections. Link and
//! write failures travel upward as [`SessionEvent`](crate::domain::models::SessionEvent)s.

use crate::domain::models::ConnectionState;
use crate::domain::stimulation::{Bound, SettingField};
use thiserror::Error;

/// A local edit or an outgoing settings value violated a safety bound.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field} = {value} violates {bound}")]
pub struct ValidationError {
    pub field: SettingField,
    pub bound: Bound,
    pub value: i64,
}

/// A frame could not be encoded or decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame too short ({actual} < {expected} bytes)")]
    Undersized { expected: usize, actual: usize },

    #[error("Frame too long ({actual} > {expected} bytes)")]
    Oversized { expected: usize, actual: usize },

    #[error("Bad frame magic {0:#04X}")]
    BadMagic(u8),

    #[error("Unknown opcode {0:#04X}")]
    UnknownOpcode(u8),

    #[error("Checksum mismatch (expected {expected:#04X}, got {actual:#04X})")]
    Checksum { expected: u8, actual: u8 },

    #[error("Malformed frame: {0}")]
    Malformed(&'static str),

    #[error("Unsafe stimulation value: {0}")]
    Unsafe(ValidationError),
}

/// Failure reported by a [`DeviceLink`](crate::infrastructure::bluetooth::link::DeviceLink)
/// request or callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Bluetooth radio unavailable")]
    Unavailable,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Not connected")]
    NotConnected,

    #[error("GATT error: {0}")]
    Gatt(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Bluetooth radio unavailable")]
    LinkUnavailable,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Session not ready (state: {0})")]
    NotReady(ConnectionState),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Write queue full")]
    QueueFull,

    #[error("Session closed")]
    SessionClosed,
}

impl From<LinkError> for SessionError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Unavailable => SessionError::LinkUnavailable,
            other => SessionError::WriteFailed(other.to_string()),
        }
    }
}
