//! RoboRoach Stimulation Protocol
//!
//! This module contains the protocol definitions for communicating with
//! the RoboRoach stimulation backpack. Callers only ever see typed values;
//! the frame layout below stays private to this module.

use crate::domain::errors::ProtocolError;
use crate::domain::models::{Direction, MovementCommand};
use crate::domain::stimulation::{SafetyBounds, StimulationSettings};
use tracing::{error, trace};

/// RoboRoach BLE Service UUID
pub const SERVICE_UUID: &str = "0000b2b0-0000-1000-8000-00805f9b34fb";

/// Command Characteristic UUID - where host frames are written
pub const COMMAND_CHAR_UUID: &str = "0000b2be-0000-1000-8000-00805f9b34fb";

/// Status Characteristic UUID - reads return the current settings report; acks and
/// housekeeping reports arrive here as notifications
pub const STATUS_CHAR_UUID: &str = "0000b2bf-0000-1000-8000-00805f9b34fb";

/// Advertised local name prefix of RoboRoach backpacks
pub const DEVICE_NAME_PREFIX: &str = "RoboRoach";

/// Every frame in either direction has this exact size
pub const FRAME_LEN: usize = 12;

const MAGIC: u8 = 0xB2;
const PAYLOAD_START: usize = 3;
const CHECKSUM_INDEX: usize = FRAME_LEN - 1;

const FLAG_RANDOM: u8 = 0x01;
const FLAG_LEFT: u8 = 0x02;
const FLAG_RIGHT: u8 = 0x04;
const FLAG_MASK: u8 = FLAG_RANDOM | FLAG_LEFT | FLAG_RIGHT;

/// Acknowledgement status meaning the device applied the frame
pub const ACK_OK: u8 = 0x00;
/// Acknowledgement status meaning the device refused the frame
pub const ACK_REJECTED: u8 = 0x01;

pub mod opcode {
    // Host -> device
    pub const WRITE_SETTINGS: u8 = 0x01;
    pub const MOVEMENT: u8 = 0x02;
    // Device -> host
    pub const SETTINGS_REPORT: u8 = 0x81;
    pub const ACK: u8 = 0x82;
    pub const BATTERY_REPORT: u8 = 0x83;
    pub const REVISION_REPORT: u8 = 0x84;
}

pub type Frame = [u8; FRAME_LEN];

/// Acknowledgement of one host frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub sequence: u8,
    pub opcode: u8,
    pub status: u8,
}

impl Ack {
    pub fn is_ok(&self) -> bool {
        self.status == ACK_OK
    }
}

/// A decoded device -> host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFrame {
    Settings(StimulationSettings),
    Ack(Ack),
    Battery(u8),
    Revision {
        hardware: (u8, u8),
        firmware: (u8, u8),
    },
}

/// A decoded host -> device frame. Only the device side (and the simulator)
/// needs these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFrame {
    WriteSettings(StimulationSettings),
    Movement(MovementCommand),
}

/// Compute the frame checksum (XOR of every byte before the checksum slot)
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

fn build_frame(opcode: u8, sequence: u8, payload: [u8; 8]) -> Frame {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = MAGIC;
    frame[1] = opcode;
    frame[2] = sequence;
    frame[PAYLOAD_START..CHECKSUM_INDEX].copy_from_slice(&payload);
    frame[CHECKSUM_INDEX] = checksum(&frame[..CHECKSUM_INDEX]);
    frame
}

/// Check size, magic and checksum; return (opcode, sequence, payload).
fn open_frame(bytes: &[u8]) -> Result<(u8, u8, [u8; 8]), ProtocolError> {
    if bytes.len() < FRAME_LEN {
        return Err(ProtocolError::Undersized {
            expected: FRAME_LEN,
            actual: bytes.len(),
        });
    }
    if bytes.len() > FRAME_LEN {
        return Err(ProtocolError::Oversized {
            expected: FRAME_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[0] != MAGIC {
        return Err(ProtocolError::BadMagic(bytes[0]));
    }
    let expected = checksum(&bytes[..CHECKSUM_INDEX]);
    let actual = bytes[CHECKSUM_INDEX];
    if expected != actual {
        return Err(ProtocolError::Checksum { expected, actual });
    }

    let mut payload = [0u8; 8];
    payload.copy_from_slice(&bytes[PAYLOAD_START..CHECKSUM_INDEX]);
    Ok((bytes[1], bytes[2], payload))
}

/// Encoder/decoder for RoboRoach frames.
///
/// # Frame Structure (12 bytes)
///
/// ```text
/// [0]     : Magic 0xB2
/// [1]     : Opcode
/// [2]     : Sequence number (echoed by acknowledgements)
/// [3-10]  : Payload (little-endian integers)
/// [11]    : Checksum (XOR of bytes 0-10)
///
/// Settings payload (WRITE_SETTINGS, SETTINGS_REPORT):
/// [3-4]   : Frequency in Hz (u16)
/// [5-6]   : Pulse width in microseconds (u16)
/// [7-8]   : Stimulation duration in milliseconds (u16)
/// [9]     : Gain in percent (u8)
/// [10]    : Flags
///           bit 0: Random mode
///           bit 1: Left channel enabled
///           bit 2: Right channel enabled
///
/// Movement payload:
/// [3]     : Direction (0 none, 1 left, 2 right)
/// [4-5]   : Duration in milliseconds (u16)
///
/// Ack payload:
/// [3]     : Acknowledged opcode
/// [4]     : Status (0 ok)
///
/// Battery payload:
/// [3]     : Battery level in percent
///
/// Revision payload:
/// [3-4]   : Hardware major.minor
/// [5-6]   : Firmware major.minor
/// ```
#[derive(Debug, Clone)]
pub struct StimulationCodec {
    bounds: SafetyBounds,
}

impl StimulationCodec {
    pub fn new(bounds: SafetyBounds) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> &SafetyBounds {
        &self.bounds
    }

    /// Encode a settings write. Refuses anything outside the safety bounds.
    pub fn encode_settings(
        &self,
        sequence: u8,
        settings: &StimulationSettings,
    ) -> Result<Frame, ProtocolError> {
        if let Err(violation) = self.bounds.validate(settings) {
            // Validation belongs upstream; reaching here means a caller skipped it.
            error!("Refusing to encode unsafe settings: {}", violation);
            return Err(ProtocolError::Unsafe(violation));
        }
        let frame = build_frame(
            opcode::WRITE_SETTINGS,
            sequence,
            settings_payload(settings),
        );
        trace!("Encoded settings frame: {:02X?}", frame);
        Ok(frame)
    }

    /// Encode a movement command. Durations are clamped to the safety range.
    pub fn encode_movement(&self, sequence: u8, command: &MovementCommand) -> Frame {
        let (direction, duration_ms) = match command.direction {
            Direction::None => (0u8, 0u16),
            Direction::Left => (
                1,
                self.bounds
                    .duration_ms
                    .clamp(i64::from(command.duration_ms)),
            ),
            Direction::Right => (
                2,
                self.bounds
                    .duration_ms
                    .clamp(i64::from(command.duration_ms)),
            ),
        };
        let mut payload = [0u8; 8];
        payload[0] = direction;
        payload[1..3].copy_from_slice(&duration_ms.to_le_bytes());
        let frame = build_frame(opcode::MOVEMENT, sequence, payload);
        trace!("Encoded movement frame: {:02X?}", frame);
        frame
    }

    /// Decode a frame received from the device.
    pub fn decode(&self, bytes: &[u8]) -> Result<DeviceFrame, ProtocolError> {
        trace!("Raw device frame: {:02X?}", bytes);
        let (op, sequence, payload) = open_frame(bytes)?;

        match op {
            opcode::SETTINGS_REPORT => {
                let settings = parse_settings_payload(&payload)?;
                self.bounds
                    .validate(&settings)
                    .map_err(ProtocolError::Unsafe)?;
                Ok(DeviceFrame::Settings(settings))
            }
            opcode::ACK => Ok(DeviceFrame::Ack(Ack {
                sequence,
                opcode: payload[0],
                status: payload[1],
            })),
            opcode::BATTERY_REPORT => {
                if payload[0] > 100 {
                    return Err(ProtocolError::Malformed("battery level above 100%"));
                }
                Ok(DeviceFrame::Battery(payload[0]))
            }
            opcode::REVISION_REPORT => Ok(DeviceFrame::Revision {
                hardware: (payload[0], payload[1]),
                firmware: (payload[2], payload[3]),
            }),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    /// Decode a frame written by the host, returning its sequence number.
    pub fn decode_request(&self, bytes: &[u8]) -> Result<(u8, HostFrame), ProtocolError> {
        let (op, sequence, payload) = open_frame(bytes)?;
        let frame = match op {
            opcode::WRITE_SETTINGS => HostFrame::WriteSettings(parse_settings_payload(&payload)?),
            opcode::MOVEMENT => {
                let duration_ms = u16::from_le_bytes([payload[1], payload[2]]);
                let direction = match payload[0] {
                    0 => Direction::None,
                    1 => Direction::Left,
                    2 => Direction::Right,
                    _ => return Err(ProtocolError::Malformed("unknown direction")),
                };
                HostFrame::Movement(MovementCommand {
                    direction,
                    duration_ms,
                })
            }
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok((sequence, frame))
    }

    /// Encode a device -> host frame.
    pub fn encode_report(&self, sequence: u8, frame: &DeviceFrame) -> Frame {
        match frame {
            DeviceFrame::Settings(settings) => build_frame(
                opcode::SETTINGS_REPORT,
                sequence,
                settings_payload(settings),
            ),
            DeviceFrame::Ack(ack) => {
                let mut payload = [0u8; 8];
                payload[0] = ack.opcode;
                payload[1] = ack.status;
                build_frame(opcode::ACK, ack.sequence, payload)
            }
            DeviceFrame::Battery(level) => {
                let mut payload = [0u8; 8];
                payload[0] = *level;
                build_frame(opcode::BATTERY_REPORT, sequence, payload)
            }
            DeviceFrame::Revision { hardware, firmware } => {
                let mut payload = [0u8; 8];
                payload[0] = hardware.0;
                payload[1] = hardware.1;
                payload[2] = firmware.0;
                payload[3] = firmware.1;
                build_frame(opcode::REVISION_REPORT, sequence, payload)
            }
        }
    }
}

fn settings_payload(settings: &StimulationSettings) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[0..2].copy_from_slice(&settings.frequency_hz.to_le_bytes());
    payload[2..4].copy_from_slice(&settings.pulse_width_us.to_le_bytes());
    payload[4..6].copy_from_slice(&settings.duration_ms.to_le_bytes());
    payload[6] = settings.gain_percent;

    let mut flags = 0u8;
    if settings.random_mode {
        flags |= FLAG_RANDOM;
    }
    if settings.left_enabled {
        flags |= FLAG_LEFT;
    }
    if settings.right_enabled {
        flags |= FLAG_RIGHT;
    }
    payload[7] = flags;
    payload
}

fn parse_settings_payload(payload: &[u8; 8]) -> Result<StimulationSettings, ProtocolError> {
    let flags = payload[7];
    if flags & !FLAG_MASK != 0 {
        return Err(ProtocolError::Malformed("reserved flag bits set"));
    }

    Ok(StimulationSettings {
        frequency_hz: u16::from_le_bytes([payload[0], payload[1]]),
        pulse_width_us: u16::from_le_bytes([payload[2], payload[3]]),
        duration_ms: u16::from_le_bytes([payload[4], payload[5]]),
        gain_percent: payload[6],
        random_mode: flags & FLAG_RANDOM != 0,
        left_enabled: flags & FLAG_LEFT != 0,
        right_enabled: flags & FLAG_RIGHT != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stimulation::{Bound, SettingField};

    fn codec() -> StimulationCodec {
        StimulationCodec::new(SafetyBounds::default())
    }

    /// Reflect a host settings frame back as a device report.
    fn as_report(frame: &Frame) -> Frame {
        let mut report = *frame;
        report[1] = opcode::SETTINGS_REPORT;
        report[CHECKSUM_INDEX] = checksum(&report[..CHECKSUM_INDEX]);
        report
    }

    #[test]
    fn test_settings_round_trip() {
        let codec = codec();
        let samples = [
            StimulationSettings::default(),
            StimulationSettings {
                frequency_hz: 1,
                pulse_width_us: 50_000,
                duration_ms: 10,
                gain_percent: 0,
                random_mode: false,
                left_enabled: false,
                right_enabled: true,
            },
            StimulationSettings {
                frequency_hz: 150,
                pulse_width_us: 1_000,
                duration_ms: 1_000,
                gain_percent: 100,
                random_mode: true,
                left_enabled: true,
                right_enabled: false,
            },
        ];

        for settings in samples {
            let frame = codec.encode_settings(7, &settings).unwrap();
            assert_eq!(frame.len(), FRAME_LEN);
            let decoded = codec.decode(&as_report(&frame)).unwrap();
            assert_eq!(decoded, DeviceFrame::Settings(settings));
        }
    }

    #[test]
    fn test_settings_layout() {
        let frame = codec()
            .encode_settings(0x10, &StimulationSettings::default())
            .unwrap();
        assert_eq!(frame[0], 0xB2);
        assert_eq!(frame[1], opcode::WRITE_SETTINGS);
        assert_eq!(frame[2], 0x10);
        assert_eq!(u16::from_le_bytes([frame[3], frame[4]]), 55);
        assert_eq!(u16::from_le_bytes([frame[5], frame[6]]), 9_000);
        assert_eq!(u16::from_le_bytes([frame[7], frame[8]]), 1_000);
        assert_eq!(frame[9], 50);
        assert_eq!(frame[10], FLAG_LEFT | FLAG_RIGHT);
        assert_eq!(frame[11], checksum(&frame[..11]));
    }

    #[test]
    fn test_encode_rejects_unsafe_settings() {
        let settings = StimulationSettings {
            frequency_hz: 400,
            ..Default::default()
        };
        let err = codec().encode_settings(0, &settings).unwrap_err();
        match err {
            ProtocolError::Unsafe(violation) => {
                assert_eq!(violation.field, SettingField::Frequency);
                assert_eq!(violation.bound, Bound::Max(150));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_movement_duration_is_clamped() {
        let codec = codec();
        let frame = codec.encode_movement(1, &MovementCommand::left(5_000));
        let (seq, decoded) = codec.decode_request(&frame).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(decoded, HostFrame::Movement(MovementCommand::left(1_000)));

        let frame = codec.encode_movement(2, &MovementCommand::right(1));
        let (_, decoded) = codec.decode_request(&frame).unwrap();
        assert_eq!(decoded, HostFrame::Movement(MovementCommand::right(10)));

        let frame = codec.encode_movement(3, &MovementCommand::none());
        let (_, decoded) = codec.decode_request(&frame).unwrap();
        assert_eq!(decoded, HostFrame::Movement(MovementCommand::none()));
    }

    #[test]
    fn test_decode_undersized_frame() {
        let err = codec().decode(&[0xB2, 0x82, 0x00]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Undersized {
                expected: FRAME_LEN,
                actual: 3
            }
        );
    }

    #[test]
    fn test_decode_checksum_failure() {
        let codec = codec();
        let mut frame = codec.encode_report(
            0,
            &DeviceFrame::Ack(Ack {
                sequence: 4,
                opcode: opcode::MOVEMENT,
                status: ACK_OK,
            }),
        );
        frame[4] ^= 0xFF;
        assert!(matches!(
            codec.decode(&frame),
            Err(ProtocolError::Checksum { .. })
        ));
    }

    #[test]
    fn test_decode_bad_magic_and_opcode() {
        let codec = codec();
        let mut frame = codec.encode_report(0, &DeviceFrame::Battery(80));
        frame[0] = 0x00;
        frame[CHECKSUM_INDEX] = checksum(&frame[..CHECKSUM_INDEX]);
        assert_eq!(codec.decode(&frame), Err(ProtocolError::BadMagic(0x00)));

        let frame = build_frame(0x7F, 0, [0u8; 8]);
        assert_eq!(codec.decode(&frame), Err(ProtocolError::UnknownOpcode(0x7F)));
    }

    #[test]
    fn test_decode_rejects_out_of_range_report() {
        let codec = codec();
        let unsafe_settings = StimulationSettings {
            duration_ms: 60_000,
            ..Default::default()
        };
        let frame = build_frame(
            opcode::SETTINGS_REPORT,
            0,
            settings_payload(&unsafe_settings),
        );
        assert!(matches!(
            codec.decode(&frame),
            Err(ProtocolError::Unsafe(_))
        ));
    }

    #[test]
    fn test_decode_device_info_frames() {
        let codec = codec();
        let battery = codec.encode_report(0, &DeviceFrame::Battery(73));
        assert_eq!(codec.decode(&battery).unwrap(), DeviceFrame::Battery(73));

        let revision = DeviceFrame::Revision {
            hardware: (2, 1),
            firmware: (1, 4),
        };
        let frame = codec.encode_report(0, &revision);
        assert_eq!(codec.decode(&frame).unwrap(), revision);
    }

    #[test]
    fn test_ack_echoes_sequence() {
        let codec = codec();
        let ack = Ack {
            sequence: 0x2A,
            opcode: opcode::WRITE_SETTINGS,
            status: ACK_REJECTED,
        };
        let frame = codec.encode_report(0, &DeviceFrame::Ack(ack));
        match codec.decode(&frame).unwrap() {
            DeviceFrame::Ack(decoded) => {
                assert_eq!(decoded, ack);
                assert!(!decoded.is_ok());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
