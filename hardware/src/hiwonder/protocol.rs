//! Hiwonder HX-35 bus servo wire protocol.
//!
//! The HX-35 shares the LewanSoul half-duplex UART protocol. Every command and
//! every reply is a single frame:
//!
//! ```text
//! -------------------------------------------------------------------
//! Header   |ID number |Data Length |Command |Parameter     |Checksum
//! -------------------------------------------------------------------
//! 0x55,0x55|ID        |Length      |Cmd     |Prm 1... Prm N|Checksum
//! -------------------------------------------------------------------
//! ```
//!
//! `Length` counts itself, the command byte, the parameters and the checksum
//! (`N + 3`). The checksum is the bitwise NOT of the byte sum of everything
//! after the header, truncated to the low byte.
//!
//! Multi-byte parameters are little-endian 16-bit words. Positions are
//! reported as signed words, 1500 counts per full turn.
//!
//! # Example
//!
//! ```
//! use hardware::hiwonder::{decode, encode, Command, ReplyData};
//!
//! let frame = encode(1, &Command::MoveTimeWrite { position: 500, time_ms: 1000 });
//! assert_eq!(frame, vec![0x55, 0x55, 0x01, 0x07, 0x01, 0xF4, 0x01, 0xE8, 0x03, 0x16]);
//!
//! let reply = decode(&[0x55, 0x55, 0x01, 0x05, 0x1C, 0xF4, 0x01, 0xE8]).unwrap();
//! assert_eq!(reply.id, 1);
//! assert_eq!(reply.data, ReplyData::Position(500));
//! ```

use strum::{Display, EnumIter};
use thiserror::Error;

/// Two-byte frame preamble.
pub const HEADER: [u8; 2] = [0x55, 0x55];

/// Highest addressable servo ID. 254 is the broadcast address.
pub const MAX_SERVO_ID: u8 = 253;

/// Broadcast address. Servos never reply to it.
pub const BROADCAST_ID: u8 = 254;

/// Smallest valid `Length` byte (no parameters).
pub const MIN_LENGTH: u8 = 3;

/// Largest `Length` byte in the command set (four parameter bytes).
pub const MAX_LENGTH: u8 = 7;

/// Largest complete frame on the bus, in bytes.
pub const MAX_FRAME_LEN: usize = HEADER.len() + 2 + MAX_LENGTH as usize - 1;

/// Raw position counts per full revolution.
pub const COUNTS_PER_REV: i32 = 1500;

/// Highest raw position accepted by MOVE_TIME_WRITE (360°).
pub const POSITION_MAX: i32 = COUNTS_PER_REV;

/// Lowest raw position that can be commanded safely.
///
/// The HX-35 overshoots and runs to full travel when commanded to exactly 0;
/// anything from 2 counts up behaves.
pub const POSITION_MIN_SAFE: i32 = 2;

/// Longest move time the servo accepts, in milliseconds.
pub const MOVE_TIME_MAX_MS: u16 = 30_000;

/// Opcodes used by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum Opcode {
    MoveTimeWrite = 1,
    MoveTimeRead = 2,
    MoveStop = 12,
    IdWrite = 13,
    IdRead = 14,
    AngleLimitWrite = 20,
    AngleLimitRead = 21,
    VinLimitWrite = 22,
    VinLimitRead = 23,
    TempMaxLimitWrite = 24,
    TempMaxLimitRead = 25,
    TempRead = 26,
    VinRead = 27,
    PosRead = 28,
    MotorModeWrite = 29,
    MotorModeRead = 30,
    LoadOrUnloadWrite = 31,
    LoadOrUnloadRead = 32,
    LedErrorRead = 36,
}

impl Opcode {
    /// Look up an opcode from its wire value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|op| *op as u8 == byte)
    }

    /// Number of parameter bytes in a reply to this opcode, if it has one.
    pub fn reply_len(self) -> Option<usize> {
        match self {
            Opcode::MoveTimeRead
            | Opcode::AngleLimitRead
            | Opcode::VinLimitRead
            | Opcode::MotorModeRead => Some(4),
            Opcode::VinRead | Opcode::PosRead => Some(2),
            Opcode::IdRead
            | Opcode::TempMaxLimitRead
            | Opcode::TempRead
            | Opcode::LoadOrUnloadRead
            | Opcode::LedErrorRead => Some(1),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Conditions that make the servo flash its LED and cut torque.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AlarmTriggers: u8 {
        const OVER_TEMPERATURE = 0b001;
        const OVER_VOLTAGE = 0b010;
        const ROTOR_LOCKED = 0b100;
    }
}

/// Servo operating mode as reported by OR_MOTOR_MODE_READ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorMode {
    /// Position control (the mode this controller uses).
    Servo,
    /// Continuous rotation at a signed speed (-1000..=1000).
    Motor { speed: i16 },
}

/// A command addressed to one servo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    MoveTimeWrite { position: u16, time_ms: u16 },
    MoveTimeRead,
    MoveStop,
    IdWrite { new_id: u8 },
    IdRead,
    AngleLimitWrite { min: u16, max: u16 },
    AngleLimitRead,
    VinLimitWrite { min_mv: u16, max_mv: u16 },
    VinLimitRead,
    TempMaxLimitWrite { celsius: u8 },
    TempMaxLimitRead,
    TempRead,
    VinRead,
    PosRead,
    MotorModeWrite(MotorMode),
    MotorModeRead,
    SetTorque { enabled: bool },
    TorqueRead,
    AlarmTriggersRead,
}

impl Command {
    /// Opcode carried by this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::MoveTimeWrite { .. } => Opcode::MoveTimeWrite,
            Command::MoveTimeRead => Opcode::MoveTimeRead,
            Command::MoveStop => Opcode::MoveStop,
            Command::IdWrite { .. } => Opcode::IdWrite,
            Command::IdRead => Opcode::IdRead,
            Command::AngleLimitWrite { .. } => Opcode::AngleLimitWrite,
            Command::AngleLimitRead => Opcode::AngleLimitRead,
            Command::VinLimitWrite { .. } => Opcode::VinLimitWrite,
            Command::VinLimitRead => Opcode::VinLimitRead,
            Command::TempMaxLimitWrite { .. } => Opcode::TempMaxLimitWrite,
            Command::TempMaxLimitRead => Opcode::TempMaxLimitRead,
            Command::TempRead => Opcode::TempRead,
            Command::VinRead => Opcode::VinRead,
            Command::PosRead => Opcode::PosRead,
            Command::MotorModeWrite(_) => Opcode::MotorModeWrite,
            Command::MotorModeRead => Opcode::MotorModeRead,
            Command::SetTorque { .. } => Opcode::LoadOrUnloadWrite,
            Command::TorqueRead => Opcode::LoadOrUnloadRead,
            Command::AlarmTriggersRead => Opcode::LedErrorRead,
        }
    }

    /// Whether the servo answers this command with a reply frame.
    pub fn expects_reply(&self) -> bool {
        self.opcode().reply_len().is_some()
    }

    fn params(&self) -> Vec<u8> {
        match *self {
            Command::MoveTimeWrite { position, time_ms } => words(&[position, time_ms]),
            Command::IdWrite { new_id } => vec![new_id],
            Command::AngleLimitWrite { min, max } => words(&[min, max]),
            Command::VinLimitWrite { min_mv, max_mv } => words(&[min_mv, max_mv]),
            Command::TempMaxLimitWrite { celsius } => vec![celsius],
            Command::MotorModeWrite(MotorMode::Servo) => vec![0, 0, 0, 0],
            Command::MotorModeWrite(MotorMode::Motor { speed }) => {
                let [lo, hi] = speed.to_le_bytes();
                vec![1, 0, lo, hi]
            }
            Command::SetTorque { enabled } => vec![u8::from(enabled)],
            _ => Vec::new(),
        }
    }
}

fn words(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decoded reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyData {
    /// Present position (can be slightly negative near the end stop).
    Position(i16),
    /// Internal temperature in °C.
    Temperature(i8),
    /// Supply voltage in millivolts.
    Voltage(u16),
    /// Target and duration of the last MOVE_TIME_WRITE.
    MoveTime { position: u16, time_ms: u16 },
    /// Configured bus address.
    Id(u8),
    AngleLimits { min: u16, max: u16 },
    VinLimits { min_mv: u16, max_mv: u16 },
    TempMaxLimit(i8),
    MotorMode(MotorMode),
    TorqueEnabled(bool),
    AlarmTriggers(AlarmTriggers),
}

/// A validated reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub id: u8,
    pub opcode: Opcode,
    pub data: ReplyData,
}

/// Errors produced while decoding a reply frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Stored checksum does not match the frame contents.
    #[error("bad checksum: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    /// Frame structure is invalid (header, length, opcode or payload size).
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Compute the checksum over the bytes following the header.
pub fn checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    !sum
}

/// Encode a command for servo `id` into a complete frame.
pub fn encode(id: u8, command: &Command) -> Vec<u8> {
    let params = command.params();
    let length = params.len() as u8 + MIN_LENGTH;

    let mut frame = Vec::with_capacity(params.len() + 6);
    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.push(length);
    frame.push(command.opcode() as u8);
    frame.extend_from_slice(&params);
    frame.push(checksum(&frame[HEADER.len()..]));
    frame
}

/// Decode and validate a reply frame.
///
/// The checksum is verified before anything else in the body is interpreted,
/// so a corrupted frame is never partially trusted.
pub fn decode(frame: &[u8]) -> Result<Reply, CodecError> {
    if frame.len() < HEADER.len() + 4 {
        return Err(CodecError::Malformed(format!(
            "frame too short ({} bytes)",
            frame.len()
        )));
    }
    if frame[..2] != HEADER {
        return Err(CodecError::Malformed(format!(
            "invalid header {:#04x},{:#04x}",
            frame[0], frame[1]
        )));
    }

    let length = frame[3];
    if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) || frame.len() != length as usize + 3 {
        return Err(CodecError::Malformed(format!(
            "length byte {length} does not match {} byte frame",
            frame.len()
        )));
    }

    let (body, stored) = frame[HEADER.len()..].split_at(frame.len() - 3);
    let expected = checksum(body);
    if expected != stored[0] {
        return Err(CodecError::Checksum {
            expected,
            actual: stored[0],
        });
    }

    let id = body[0];
    let opcode = Opcode::from_byte(body[2])
        .ok_or_else(|| CodecError::Malformed(format!("unknown opcode {}", body[2])))?;
    let params = &body[3..];

    let wanted = opcode
        .reply_len()
        .ok_or_else(|| CodecError::Malformed(format!("{opcode} has no reply form")))?;
    if params.len() != wanted {
        return Err(CodecError::Malformed(format!(
            "{opcode} reply carries {} bytes, expected {wanted}",
            params.len()
        )));
    }

    let word = |i: usize| u16::from_le_bytes([params[i], params[i + 1]]);
    let data = match opcode {
        Opcode::PosRead => ReplyData::Position(word(0) as i16),
        Opcode::TempRead => ReplyData::Temperature(params[0] as i8),
        Opcode::VinRead => ReplyData::Voltage(word(0)),
        Opcode::MoveTimeRead => ReplyData::MoveTime {
            position: word(0),
            time_ms: word(2),
        },
        Opcode::IdRead => ReplyData::Id(params[0]),
        Opcode::AngleLimitRead => ReplyData::AngleLimits {
            min: word(0),
            max: word(2),
        },
        Opcode::VinLimitRead => ReplyData::VinLimits {
            min_mv: word(0),
            max_mv: word(2),
        },
        Opcode::TempMaxLimitRead => ReplyData::TempMaxLimit(params[0] as i8),
        Opcode::MotorModeRead => ReplyData::MotorMode(if params[0] == 1 {
            MotorMode::Motor {
                speed: word(2) as i16,
            }
        } else {
            MotorMode::Servo
        }),
        Opcode::LoadOrUnloadRead => ReplyData::TorqueEnabled(params[0] == 1),
        Opcode::LedErrorRead => {
            ReplyData::AlarmTriggers(AlarmTriggers::from_bits_truncate(params[0]))
        }
        _ => {
            return Err(CodecError::Malformed(format!(
                "{opcode} has no reply form"
            )))
        }
    };

    Ok(Reply { id, opcode, data })
}

/// Build a reply frame as a servo would send it.
///
/// Used by the simulated bus and by tests that need valid replies.
pub fn encode_reply(id: u8, data: &ReplyData) -> Vec<u8> {
    let (opcode, params): (Opcode, Vec<u8>) = match *data {
        ReplyData::Position(p) => (Opcode::PosRead, p.to_le_bytes().to_vec()),
        ReplyData::Temperature(t) => (Opcode::TempRead, vec![t as u8]),
        ReplyData::Voltage(mv) => (Opcode::VinRead, mv.to_le_bytes().to_vec()),
        ReplyData::MoveTime { position, time_ms } => {
            (Opcode::MoveTimeRead, words(&[position, time_ms]))
        }
        ReplyData::Id(id) => (Opcode::IdRead, vec![id]),
        ReplyData::AngleLimits { min, max } => (Opcode::AngleLimitRead, words(&[min, max])),
        ReplyData::VinLimits { min_mv, max_mv } => {
            (Opcode::VinLimitRead, words(&[min_mv, max_mv]))
        }
        ReplyData::TempMaxLimit(t) => (Opcode::TempMaxLimitRead, vec![t as u8]),
        ReplyData::MotorMode(MotorMode::Servo) => (Opcode::MotorModeRead, vec![0, 0, 0, 0]),
        ReplyData::MotorMode(MotorMode::Motor { speed }) => {
            let [lo, hi] = speed.to_le_bytes();
            (Opcode::MotorModeRead, vec![1, 0, lo, hi])
        }
        ReplyData::TorqueEnabled(on) => (Opcode::LoadOrUnloadRead, vec![u8::from(on)]),
        ReplyData::AlarmTriggers(flags) => (Opcode::LedErrorRead, vec![flags.bits()]),
    };

    let mut frame = Vec::with_capacity(params.len() + 6);
    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.push(params.len() as u8 + MIN_LENGTH);
    frame.push(opcode as u8);
    frame.extend_from_slice(&params);
    frame.push(checksum(&frame[HEADER.len()..]));
    frame
}

/// Convert degrees to raw position counts.
pub fn degrees_to_counts(degrees: f64) -> i32 {
    (degrees * COUNTS_PER_REV as f64 / 360.0).round() as i32
}

/// Convert raw position counts to degrees.
pub fn counts_to_degrees(counts: i32) -> f64 {
    counts as f64 * 360.0 / COUNTS_PER_REV as f64
}
