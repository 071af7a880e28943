//! Per-servo proxy for HX-35 bus servos.
//!
//! A [`ServoProxy`] owns the last known state of one physical servo and turns
//! typed operations into command frames. It never owns the bus: every method
//! that talks to the servo borrows the [`LinkSession`] for the duration of a
//! single exchange, so whoever owns the session decides the order in which
//! servos get the bus.
//!
//! State is only ever updated from a fully validated reply. Issuing a move
//! does not change the recorded position; arrival is observed by a later
//! [`ServoProxy::read_state`].

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::protocol::{
    decode, encode, AlarmTriggers, CodecError, Command, MotorMode, ReplyData, MAX_SERVO_ID,
    MOVE_TIME_MAX_MS, POSITION_MAX, POSITION_MIN_SAFE,
};
use super::transport::{LinkSession, TransportError};

/// Default age after which a reading is reported stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(2);

/// Accepted range of the over-temperature limit, °C.
pub const TEMP_LIMIT_RANGE: (u8, u8) = (50, 100);

/// Accepted range of the supply voltage limits, mV.
pub const VIN_LIMIT_RANGE: (u16, u16) = (4500, 12000);

/// Largest power-of-two multiple of the interval a failing telemetry read
/// backs off to.
const TELEMETRY_MAX_BACKOFF_SHIFT: u32 = 5;

/// Errors from a servo exchange.
#[derive(Error, Debug)]
pub enum ServoError {
    /// The link failed, timed out or is unavailable.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The reply was corrupt or did not answer the request.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Argument rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type ServoResult<T> = Result<T, ServoError>;

/// Logical role of a servo in the eyepiece assembly.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServoRole {
    Focuser,
    Zoom,
}

/// Bus address plus role. Fixed for the lifetime of a proxy, except through
/// provisioning with [`ServoProxy::set_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoIdentity {
    pub id: u8,
    pub role: ServoRole,
}

impl fmt::Display for ServoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id {})", self.role, self.id)
    }
}

/// Allowed raw travel and largest single-command step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelLimits {
    pub min: i32,
    pub max: i32,
    pub max_step: i32,
}

impl TravelLimits {
    pub fn new(min: i32, max: i32, max_step: i32) -> Self {
        Self { min, max, max_step }
    }

    /// Limits actually enforced on the wire, narrowed to what the servo can
    /// be commanded to safely.
    pub fn effective(&self) -> (i32, i32) {
        (self.min.max(POSITION_MIN_SAFE), self.max.min(POSITION_MAX))
    }

    pub fn contains(&self, raw: i32) -> bool {
        let (lo, hi) = self.effective();
        (lo..=hi).contains(&raw)
    }

    /// Clamp `raw` into range, returning the value and whether it changed.
    pub fn clamp(&self, raw: i32) -> (i32, bool) {
        let (lo, hi) = self.effective();
        let used = raw.clamp(lo, hi);
        (used, used != raw)
    }
}

impl Default for TravelLimits {
    fn default() -> Self {
        Self::new(POSITION_MIN_SAFE, 1000, 200)
    }
}

/// Freshness of the cached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LinkHealth {
    /// Never successfully read.
    Unknown,
    /// Last read succeeded and is recent.
    Fresh,
    /// Last read failed, or the last good reading is too old.
    Stale,
}

/// Last known state of a servo. Mutated only by successful reads.
#[derive(Debug, Clone)]
pub struct ServoState {
    pub position: Option<i32>,
    pub temperature_c: Option<i8>,
    pub voltage_mv: Option<u16>,
    pub torque_enabled: Option<bool>,
    pub last_read: Option<Instant>,
    pub last_telemetry: Option<Instant>,
    /// Last telemetry read attempt, successful or not.
    pub telemetry_attempt: Option<Instant>,
    /// Telemetry reads failed in a row.
    pub telemetry_failures: u32,
    pub health: LinkHealth,
}

impl Default for ServoState {
    fn default() -> Self {
        Self {
            position: None,
            temperature_c: None,
            voltage_mv: None,
            torque_enabled: None,
            last_read: None,
            last_telemetry: None,
            telemetry_attempt: None,
            telemetry_failures: 0,
            health: LinkHealth::Unknown,
        }
    }
}

/// Read-only copy of a proxy's state handed to other components.
#[derive(Debug, Clone, PartialEq)]
pub struct ServoSnapshot {
    pub identity: ServoIdentity,
    pub position: Option<i32>,
    pub temperature_c: Option<i8>,
    pub voltage_mv: Option<u16>,
    pub torque_enabled: Option<bool>,
    /// Time since the last successful position read.
    pub age: Option<Duration>,
    pub health: LinkHealth,
}

/// A requested target that had to be moved inside the travel limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clamp {
    pub requested: i32,
    pub used: i32,
}

/// Result of issuing a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    /// Position actually encoded in the frame.
    pub target: i32,
    pub time_ms: u16,
    pub clamp: Option<Clamp>,
}

/// Convert a velocity in counts per second into a MOVE_TIME_WRITE duration.
pub fn move_time_for(distance: i32, velocity: f64) -> u16 {
    if !(velocity.is_finite() && velocity > 0.0) {
        return 0;
    }
    let ms = (distance.unsigned_abs() as f64 / velocity * 1000.0).round();
    ms.min(MOVE_TIME_MAX_MS as f64) as u16
}

/// Typed access to one servo on a shared bus.
pub struct ServoProxy {
    identity: ServoIdentity,
    limits: TravelLimits,
    stale_after: Duration,
    state: ServoState,
}

impl ServoProxy {
    pub fn new(identity: ServoIdentity, limits: TravelLimits) -> Self {
        Self {
            identity,
            limits,
            stale_after: DEFAULT_STALE_AFTER,
            state: ServoState::default(),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn identity(&self) -> ServoIdentity {
        self.identity
    }

    pub fn id(&self) -> u8 {
        self.identity.id
    }

    pub fn role(&self) -> ServoRole {
        self.identity.role
    }

    pub fn limits(&self) -> TravelLimits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: TravelLimits) {
        self.limits = limits;
    }

    pub fn state(&self) -> &ServoState {
        &self.state
    }

    /// Last successfully read position.
    pub fn last_position(&self) -> Option<i32> {
        self.state.position
    }

    /// Health, downgraded to stale when the last good read is too old.
    pub fn health(&self) -> LinkHealth {
        match (self.state.health, self.state.last_read) {
            (LinkHealth::Fresh, Some(at)) if at.elapsed() > self.stale_after => LinkHealth::Stale,
            (health, _) => health,
        }
    }

    pub fn snapshot(&self) -> ServoSnapshot {
        ServoSnapshot {
            identity: self.identity,
            position: self.state.position,
            temperature_c: self.state.temperature_c,
            voltage_mv: self.state.voltage_mv,
            torque_enabled: self.state.torque_enabled,
            age: self.state.last_read.map(|at| at.elapsed()),
            health: self.health(),
        }
    }

    /// Whether a telemetry read is due. Counts from the last attempt, and
    /// the wait doubles with every consecutive failure up to 32x `interval`.
    pub fn telemetry_due(&self, interval: Duration) -> bool {
        let shift = self.state.telemetry_failures.min(TELEMETRY_MAX_BACKOFF_SHIFT);
        let wait = interval.saturating_mul(1 << shift);
        self.state
            .telemetry_attempt
            .map_or(true, |at| at.elapsed() >= wait)
    }

    fn record_telemetry(&mut self, ok: bool) {
        let now = Instant::now();
        self.state.telemetry_attempt = Some(now);
        if ok {
            self.state.last_telemetry = Some(now);
            self.state.telemetry_failures = 0;
        } else {
            self.state.telemetry_failures = self.state.telemetry_failures.saturating_add(1);
        }
    }

    // ==================== Bus exchanges ====================

    fn send(&self, link: &mut LinkSession, command: &Command) -> ServoResult<()> {
        link.write_frame(&encode(self.identity.id, command))?;
        Ok(())
    }

    fn exchange(&self, link: &mut LinkSession, command: &Command) -> ServoResult<ReplyData> {
        link.write_frame(&encode(self.identity.id, command))?;
        let frame = link.read_frame()?;
        let reply = decode(&frame)?;
        if reply.id != self.identity.id || reply.opcode != command.opcode() {
            return Err(CodecError::Malformed(format!(
                "{} reply from id {} answers {} request to id {}",
                reply.opcode,
                reply.id,
                command.opcode(),
                self.identity.id
            ))
            .into());
        }
        Ok(reply.data)
    }

    /// Exchange with a single retry on a corrupt reply. Timeouts are not
    /// retried here; they count toward link escalation instead.
    fn query(&self, link: &mut LinkSession, command: &Command) -> ServoResult<ReplyData> {
        match self.exchange(link, command) {
            Err(ServoError::Codec(e)) => {
                warn!("{}: bad {} reply ({}), retrying once", self.identity, command.opcode(), e);
                link.clear_input()?;
                self.exchange(link, command)
            }
            other => other,
        }
    }

    /// Exchange where silence is an acceptable answer. A missing reply does
    /// not count toward link escalation and a bad one is not retried.
    fn query_if_present(&self, link: &mut LinkSession, command: &Command) -> ServoResult<Option<ReplyData>> {
        let Some(frame) = link.probe(&encode(self.identity.id, command))? else {
            return Ok(None);
        };
        let reply = match decode(&frame) {
            Ok(reply) => reply,
            Err(e) => {
                link.clear_input()?;
                return Err(e.into());
            }
        };
        if reply.id != self.identity.id || reply.opcode != command.opcode() {
            return Err(CodecError::Malformed(format!(
                "{} reply from id {} answers {} request to id {}",
                reply.opcode,
                reply.id,
                command.opcode(),
                self.identity.id
            ))
            .into());
        }
        Ok(Some(reply.data))
    }

    fn unexpected(&self, command: &Command, data: ReplyData) -> ServoError {
        CodecError::Malformed(format!(
            "{}: unexpected payload {:?} for {}",
            self.identity,
            data,
            command.opcode()
        ))
        .into()
    }

    // ==================== Motion ====================

    /// Command a move to `raw`, clamped into the travel limits.
    ///
    /// `velocity_hint` is in counts per second and becomes the move time; with
    /// no hint the servo moves at full speed. Returns once the frame is on the
    /// wire.
    pub fn move_to(
        &mut self,
        link: &mut LinkSession,
        raw: i32,
        velocity_hint: Option<f64>,
    ) -> ServoResult<MoveOutcome> {
        let (target, clamped) = self.limits.clamp(raw);
        let clamp = clamped.then(|| {
            let (lo, hi) = self.limits.effective();
            warn!(
                "{}: target {} outside [{}, {}], using {}",
                self.identity, raw, lo, hi, target
            );
            Clamp {
                requested: raw,
                used: target,
            }
        });

        let distance = match self.state.position {
            Some(current) => target - current,
            None => self.limits.max - self.limits.min,
        };
        let time_ms = velocity_hint.map_or(0, |v| move_time_for(distance, v));

        debug!("{}: move to {} over {} ms", self.identity, target, time_ms);
        self.send(
            link,
            &Command::MoveTimeWrite {
                position: target as u16,
                time_ms,
            },
        )?;

        Ok(MoveOutcome {
            target,
            time_ms,
            clamp,
        })
    }

    /// Halt any move in progress.
    pub fn stop(&mut self, link: &mut LinkSession) -> ServoResult<()> {
        debug!("{}: stop", self.identity);
        self.send(link, &Command::MoveStop)
    }

    pub fn set_torque(&mut self, link: &mut LinkSession, enabled: bool) -> ServoResult<()> {
        debug!("{}: torque {}", self.identity, if enabled { "on" } else { "off" });
        self.send(link, &Command::SetTorque { enabled })
    }

    // ==================== Reads ====================

    /// Read the present position and refresh the cached state.
    ///
    /// On failure the last known position is kept and health becomes
    /// [`LinkHealth::Stale`] (or stays [`LinkHealth::Unknown`]).
    pub fn read_state(&mut self, link: &mut LinkSession) -> ServoResult<i32> {
        let command = Command::PosRead;
        match self.query(link, &command) {
            Ok(ReplyData::Position(raw)) => {
                self.state.position = Some(raw as i32);
                self.state.last_read = Some(Instant::now());
                self.state.health = LinkHealth::Fresh;
                Ok(raw as i32)
            }
            Ok(other) => {
                self.mark_stale();
                Err(self.unexpected(&command, other))
            }
            Err(e) => {
                self.mark_stale();
                Err(e)
            }
        }
    }

    fn mark_stale(&mut self) {
        if self.state.health != LinkHealth::Unknown {
            self.state.health = LinkHealth::Stale;
        }
    }

    /// Refresh temperature and supply voltage.
    pub fn read_telemetry(&mut self, link: &mut LinkSession) -> ServoResult<()> {
        let result = self.query_telemetry(link);
        self.record_telemetry(result.is_ok());
        let (temperature, voltage) = result?;
        self.store_telemetry(temperature, voltage);
        Ok(())
    }

    fn query_telemetry(&self, link: &mut LinkSession) -> ServoResult<(i8, u16)> {
        let temperature = match self.query(link, &Command::TempRead)? {
            ReplyData::Temperature(t) => t,
            other => return Err(self.unexpected(&Command::TempRead, other)),
        };
        let voltage = match self.query(link, &Command::VinRead)? {
            ReplyData::Voltage(mv) => mv,
            other => return Err(self.unexpected(&Command::VinRead, other)),
        };
        Ok((temperature, voltage))
    }

    fn store_telemetry(&mut self, temperature: i8, voltage: u16) {
        self.state.temperature_c = Some(temperature);
        self.state.voltage_mv = Some(voltage);
        debug!("{}: {} °C, {} mV", self.identity, temperature, voltage);
    }

    /// Background telemetry refresh. Unlike [`Self::read_telemetry`] a servo
    /// that stays silent never counts toward link escalation; only a failure
    /// of the link itself is an error. Returns whether readings were updated.
    pub fn poll_telemetry(&mut self, link: &mut LinkSession) -> ServoResult<bool> {
        let result = self.telemetry_if_present(link);
        self.record_telemetry(matches!(result, Ok(Some(_))));
        match result {
            Ok(Some((temperature, voltage))) => {
                self.store_telemetry(temperature, voltage);
                Ok(true)
            }
            Ok(None) => {
                debug!("{}: no telemetry reply", self.identity);
                Ok(false)
            }
            Err(ServoError::Transport(e)) => Err(e.into()),
            Err(e) => {
                debug!("{}: telemetry reply rejected: {}", self.identity, e);
                Ok(false)
            }
        }
    }

    fn telemetry_if_present(&self, link: &mut LinkSession) -> ServoResult<Option<(i8, u16)>> {
        let temperature = match self.query_if_present(link, &Command::TempRead)? {
            Some(ReplyData::Temperature(t)) => t,
            Some(other) => return Err(self.unexpected(&Command::TempRead, other)),
            None => return Ok(None),
        };
        let voltage = match self.query_if_present(link, &Command::VinRead)? {
            Some(ReplyData::Voltage(mv)) => mv,
            Some(other) => return Err(self.unexpected(&Command::VinRead, other)),
            None => return Ok(None),
        };
        Ok(Some((temperature, voltage)))
    }

    pub fn read_torque(&mut self, link: &mut LinkSession) -> ServoResult<bool> {
        match self.query(link, &Command::TorqueRead)? {
            ReplyData::TorqueEnabled(on) => {
                self.state.torque_enabled = Some(on);
                Ok(on)
            }
            other => Err(self.unexpected(&Command::TorqueRead, other)),
        }
    }

    /// Angle limits stored in the servo's own EEPROM.
    pub fn read_angle_limits(&mut self, link: &mut LinkSession) -> ServoResult<(u16, u16)> {
        match self.query(link, &Command::AngleLimitRead)? {
            ReplyData::AngleLimits { min, max } => Ok((min, max)),
            other => Err(self.unexpected(&Command::AngleLimitRead, other)),
        }
    }

    pub fn write_angle_limits(
        &mut self,
        link: &mut LinkSession,
        min: u16,
        max: u16,
    ) -> ServoResult<()> {
        if min >= max || max as i32 > POSITION_MAX {
            return Err(ServoError::InvalidArgument(format!(
                "angle limits must satisfy min < max <= {POSITION_MAX}, got [{min}, {max}]"
            )));
        }
        self.send(link, &Command::AngleLimitWrite { min, max })
    }

    /// Put the servo in position mode. A servo left in motor mode ignores
    /// MOVE_TIME_WRITE.
    pub fn set_servo_mode(&mut self, link: &mut LinkSession) -> ServoResult<()> {
        debug!("{}: servo mode", self.identity);
        self.send(link, &Command::MotorModeWrite(MotorMode::Servo))
    }

    /// Continuous rotation at `speed` (-1000..=1000). Bench use only.
    pub fn set_motor_mode(&mut self, link: &mut LinkSession, speed: i16) -> ServoResult<()> {
        if !(-1000..=1000).contains(&speed) {
            return Err(ServoError::InvalidArgument(format!(
                "motor speed {speed} outside -1000..=1000"
            )));
        }
        self.send(link, &Command::MotorModeWrite(MotorMode::Motor { speed }))
    }

    pub fn read_motor_mode(&mut self, link: &mut LinkSession) -> ServoResult<MotorMode> {
        match self.query(link, &Command::MotorModeRead)? {
            ReplyData::MotorMode(mode) => Ok(mode),
            other => Err(self.unexpected(&Command::MotorModeRead, other)),
        }
    }

    /// Temperature at which the servo cuts torque and raises its alarm.
    pub fn set_temperature_limit(&mut self, link: &mut LinkSession, celsius: u8) -> ServoResult<()> {
        let (lo, hi) = TEMP_LIMIT_RANGE;
        if !(lo..=hi).contains(&celsius) {
            return Err(ServoError::InvalidArgument(format!(
                "temperature limit {celsius} °C outside {lo}..={hi}"
            )));
        }
        self.send(link, &Command::TempMaxLimitWrite { celsius })
    }

    pub fn read_temperature_limit(&mut self, link: &mut LinkSession) -> ServoResult<i8> {
        match self.query(link, &Command::TempMaxLimitRead)? {
            ReplyData::TempMaxLimit(t) => Ok(t),
            other => Err(self.unexpected(&Command::TempMaxLimitRead, other)),
        }
    }

    pub fn set_voltage_limits(
        &mut self,
        link: &mut LinkSession,
        min_mv: u16,
        max_mv: u16,
    ) -> ServoResult<()> {
        let (lo, hi) = VIN_LIMIT_RANGE;
        if min_mv >= max_mv || min_mv < lo || max_mv > hi {
            return Err(ServoError::InvalidArgument(format!(
                "voltage limits must satisfy {lo} <= min < max <= {hi}, got [{min_mv}, {max_mv}]"
            )));
        }
        self.send(link, &Command::VinLimitWrite { min_mv, max_mv })
    }

    pub fn read_voltage_limits(&mut self, link: &mut LinkSession) -> ServoResult<(u16, u16)> {
        match self.query(link, &Command::VinLimitRead)? {
            ReplyData::VinLimits { min_mv, max_mv } => Ok((min_mv, max_mv)),
            other => Err(self.unexpected(&Command::VinLimitRead, other)),
        }
    }

    /// Target and duration of the last MOVE_TIME_WRITE the servo accepted.
    pub fn read_move_target(&mut self, link: &mut LinkSession) -> ServoResult<(u16, u16)> {
        match self.query(link, &Command::MoveTimeRead)? {
            ReplyData::MoveTime { position, time_ms } => Ok((position, time_ms)),
            other => Err(self.unexpected(&Command::MoveTimeRead, other)),
        }
    }

    pub fn read_alarm_triggers(&mut self, link: &mut LinkSession) -> ServoResult<AlarmTriggers> {
        match self.query(link, &Command::AlarmTriggersRead)? {
            ReplyData::AlarmTriggers(flags) => Ok(flags),
            other => Err(self.unexpected(&Command::AlarmTriggersRead, other)),
        }
    }

    /// Ask the servo for its ID. Used for presence checks and bus scans.
    pub fn ping(&mut self, link: &mut LinkSession) -> ServoResult<u8> {
        match self.query(link, &Command::IdRead)? {
            ReplyData::Id(id) => Ok(id),
            other => Err(self.unexpected(&Command::IdRead, other)),
        }
    }

    // ==================== Provisioning ====================

    /// Rewrite the servo's bus address.
    ///
    /// Only for provisioning a single servo on an otherwise empty bus. The
    /// proxy follows the servo to its new address.
    pub fn set_id(&mut self, link: &mut LinkSession, new_id: u8) -> ServoResult<()> {
        if new_id > MAX_SERVO_ID {
            return Err(ServoError::InvalidArgument(format!(
                "servo id {new_id} exceeds {MAX_SERVO_ID}"
            )));
        }
        self.send(link, &Command::IdWrite { new_id })?;
        info!("{}: bus address changed to {}", self.identity, new_id);
        self.identity.id = new_id;
        Ok(())
    }
}

/// Probe `ids` and return those that answer an ID read.
///
/// Timeouts are expected for absent IDs, so the scan stops early only if the
/// link itself fails.
pub fn scan(link: &mut LinkSession, ids: impl IntoIterator<Item = u8>) -> ServoResult<Vec<u8>> {
    let mut found = Vec::new();
    for id in ids {
        let Some(frame) = link.probe(&encode(id, &Command::IdRead))? else {
            continue;
        };
        match decode(&frame) {
            Ok(reply) if reply.id == id && reply.data == ReplyData::Id(id) => found.push(id),
            Ok(reply) => warn!("id {}: unexpected {:?}", id, reply),
            Err(e) => {
                warn!("id {}: {}", id, e);
                link.clear_input()?;
            }
        }
    }
    Ok(found)
}
