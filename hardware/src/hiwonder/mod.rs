//! Hiwonder HX-35 serial bus servo driver.
//!
//! Layered leaf-first:
//! - [`protocol`]: frame codec for the LewanSoul/Hiwonder command set
//! - [`transport`]: serial byte transport and link-health tracking
//! - [`servo`]: per-servo proxy with cached state and staleness
//! - [`sim`]: in-process simulated bus for tests and dry runs

pub mod protocol;
pub mod servo;
pub mod sim;
pub mod transport;

pub use protocol::{
    counts_to_degrees, decode, degrees_to_counts, encode, AlarmTriggers, CodecError, Command,
    MotorMode, Opcode, Reply, ReplyData, BROADCAST_ID, COUNTS_PER_REV, MAX_SERVO_ID,
    POSITION_MAX, POSITION_MIN_SAFE,
};
pub use servo::{
    move_time_for, scan, Clamp, LinkHealth, MoveOutcome, ServoError, ServoIdentity, ServoProxy,
    ServoResult, ServoRole, ServoSnapshot, ServoState, TravelLimits, TEMP_LIMIT_RANGE,
    VIN_LIMIT_RANGE,
};
pub use sim::{SentCommand, SimHandle, SimServo, SimulatedBus};
pub use transport::{
    LinkParams, LinkSession, SerialTransport, Transport, TransportError, TransportResult,
    DEFAULT_BAUD, DEFAULT_TIMEOUT,
};
