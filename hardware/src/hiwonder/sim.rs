//! Simulated HX-35 servo bus for tests and dry runs.
//!
//! [`SimulatedBus`] implements [`Transport`] by decoding every command frame,
//! applying it to an in-memory servo model and queueing the reply a real servo
//! would send. A cloned [`SimHandle`] shares the same state, so a test can keep
//! inspecting sent commands and injecting faults after the bus itself has been
//! handed to a session.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

use super::protocol::{
    checksum, encode_reply, AlarmTriggers, MotorMode, Opcode, ReplyData, BROADCAST_ID, HEADER,
    MIN_LENGTH,
};
use super::transport::{Transport, TransportError, TransportResult};

/// A command frame as received by the simulated servos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub id: u8,
    pub opcode: Opcode,
    pub params: Vec<u8>,
}

impl SentCommand {
    /// Target position if this is a MOVE_TIME_WRITE.
    pub fn move_target(&self) -> Option<u16> {
        match self.opcode {
            Opcode::MoveTimeWrite => Some(u16::from_le_bytes([self.params[0], self.params[1]])),
            _ => None,
        }
    }

    /// Move time in milliseconds if this is a MOVE_TIME_WRITE.
    pub fn move_time_ms(&self) -> Option<u16> {
        match self.opcode {
            Opcode::MoveTimeWrite => Some(u16::from_le_bytes([self.params[2], self.params[3]])),
            _ => None,
        }
    }
}

/// Model of one servo on the simulated bus.
#[derive(Debug, Clone)]
pub struct SimServo {
    pub id: u8,
    position: f64,
    start_position: f64,
    target: f64,
    move_started: Instant,
    move_duration: Duration,
    /// Travel speed used for zero-time moves. `None` moves instantly.
    pub speed_counts_per_s: Option<f64>,
    /// Mechanical end stops the output shaft cannot pass.
    pub hard_stops: (i32, i32),
    pub torque_enabled: bool,
    pub temperature_c: i8,
    pub voltage_mv: u16,
    pub angle_limits: (u16, u16),
    pub temperature_limit_c: i8,
    pub voltage_limits: (u16, u16),
    pub alarm_triggers: AlarmTriggers,
    pub motor_mode: MotorMode,
    /// Scripted position replies, served before the model position.
    pub scripted_positions: VecDeque<i16>,
    /// Amplitude of a +/- wobble added to alternating position reads.
    pub jitter: i32,
    jitter_phase: bool,
    /// Stop replying entirely.
    pub silent: bool,
}

impl SimServo {
    pub fn new(id: u8, position: i32) -> Self {
        Self {
            id,
            position: position as f64,
            start_position: position as f64,
            target: position as f64,
            move_started: Instant::now(),
            move_duration: Duration::ZERO,
            speed_counts_per_s: None,
            hard_stops: (0, 1500),
            torque_enabled: false,
            temperature_c: 28,
            voltage_mv: 7400,
            angle_limits: (0, 1000),
            temperature_limit_c: 85,
            voltage_limits: (4500, 12000),
            alarm_triggers: AlarmTriggers::OVER_TEMPERATURE | AlarmTriggers::ROTOR_LOCKED,
            motor_mode: MotorMode::Servo,
            scripted_positions: VecDeque::new(),
            jitter: 0,
            jitter_phase: false,
            silent: false,
        }
    }

    pub fn with_hard_stops(mut self, min: i32, max: i32) -> Self {
        self.hard_stops = (min, max);
        self
    }

    pub fn with_speed(mut self, counts_per_s: f64) -> Self {
        self.speed_counts_per_s = Some(counts_per_s);
        self
    }

    pub fn with_jitter(mut self, amplitude: i32) -> Self {
        self.jitter = amplitude;
        self
    }

    /// Present shaft position, advancing any move in progress.
    pub fn position(&mut self) -> i32 {
        let elapsed = self.move_started.elapsed();
        self.position = if self.move_duration.is_zero() || elapsed >= self.move_duration {
            self.target
        } else {
            let fraction = elapsed.as_secs_f64() / self.move_duration.as_secs_f64();
            self.start_position + (self.target - self.start_position) * fraction
        };
        let (lo, hi) = self.hard_stops;
        self.position = self.position.clamp(lo as f64, hi as f64);
        self.position.round() as i32
    }

    fn start_move(&mut self, target: u16, time_ms: u16) {
        let current = self.position() as f64;
        self.start_position = current;
        self.target = target as f64;
        self.move_started = Instant::now();
        self.move_duration = if time_ms > 0 {
            Duration::from_millis(time_ms as u64)
        } else {
            match self.speed_counts_per_s {
                Some(speed) => Duration::from_secs_f64((self.target - current).abs() / speed),
                None => Duration::ZERO,
            }
        };
    }

    fn stop(&mut self) {
        let here = self.position() as f64;
        self.start_position = here;
        self.target = here;
        self.move_duration = Duration::ZERO;
    }

    fn read_position(&mut self) -> i16 {
        if let Some(scripted) = self.scripted_positions.pop_front() {
            return scripted;
        }
        let mut pos = self.position();
        if self.jitter != 0 {
            self.jitter_phase = !self.jitter_phase;
            pos += if self.jitter_phase {
                self.jitter
            } else {
                -self.jitter
            };
        }
        pos as i16
    }
}

/// Faults applied to the next replies regardless of servo.
#[derive(Debug, Default, Clone)]
struct Faults {
    drop_replies: usize,
    corrupt_replies: usize,
    write_error: bool,
}

#[derive(Debug, Default)]
struct BusState {
    servos: HashMap<u8, SimServo>,
    pending: VecDeque<Vec<u8>>,
    sent: Vec<SentCommand>,
    faults: Faults,
    closed: bool,
}

impl BusState {
    fn handle(&mut self, frame: &[u8]) {
        let Some(command) = parse_command(frame) else {
            trace!("sim: ignoring unparsable frame {:02X?}", frame);
            return;
        };
        self.sent.push(command.clone());

        if command.id == BROADCAST_ID {
            for servo in self.servos.values_mut() {
                apply_write(servo, &command);
            }
            return;
        }

        let Some(servo) = self.servos.get_mut(&command.id) else {
            return;
        };
        let reply = apply_write(servo, &command);
        if servo.id != command.id {
            if let Some(moved) = self.servos.remove(&command.id) {
                self.servos.insert(moved.id, moved);
            }
            return;
        }
        if servo.silent {
            return;
        }
        let Some(data) = reply else {
            return;
        };

        if self.faults.drop_replies > 0 {
            self.faults.drop_replies -= 1;
            return;
        }

        let mut frame = encode_reply(servo.id, &data);
        if self.faults.corrupt_replies > 0 {
            self.faults.corrupt_replies -= 1;
            let last = frame.len() - 1;
            frame[last] ^= 0x5A;
        }
        self.pending.push_back(frame);
    }
}

fn param_word(params: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([params[i], params[i + 1]])
}

/// Apply a command to the model and return the reply payload, if any.
fn apply_write(servo: &mut SimServo, command: &SentCommand) -> Option<ReplyData> {
    let p = &command.params;
    match command.opcode {
        Opcode::MoveTimeWrite => {
            if servo.torque_enabled && servo.motor_mode == MotorMode::Servo {
                servo.start_move(param_word(p, 0), param_word(p, 2));
            }
            None
        }
        Opcode::MoveStop => {
            servo.stop();
            None
        }
        Opcode::IdWrite => {
            servo.id = p[0];
            None
        }
        Opcode::AngleLimitWrite => {
            servo.angle_limits = (param_word(p, 0), param_word(p, 2));
            None
        }
        Opcode::LoadOrUnloadWrite => {
            servo.torque_enabled = p[0] == 1;
            None
        }
        Opcode::MotorModeWrite => {
            servo.motor_mode = if p[0] == 1 {
                MotorMode::Motor {
                    speed: param_word(p, 2) as i16,
                }
            } else {
                MotorMode::Servo
            };
            None
        }
        Opcode::TempMaxLimitWrite => {
            servo.temperature_limit_c = p[0] as i8;
            None
        }
        Opcode::VinLimitWrite => {
            servo.voltage_limits = (param_word(p, 0), param_word(p, 2));
            None
        }
        Opcode::PosRead => Some(ReplyData::Position(servo.read_position())),
        Opcode::TempRead => Some(ReplyData::Temperature(servo.temperature_c)),
        Opcode::VinRead => Some(ReplyData::Voltage(servo.voltage_mv)),
        Opcode::IdRead => Some(ReplyData::Id(servo.id)),
        Opcode::AngleLimitRead => Some(ReplyData::AngleLimits {
            min: servo.angle_limits.0,
            max: servo.angle_limits.1,
        }),
        Opcode::LoadOrUnloadRead => Some(ReplyData::TorqueEnabled(servo.torque_enabled)),
        Opcode::LedErrorRead => Some(ReplyData::AlarmTriggers(servo.alarm_triggers)),
        Opcode::MotorModeRead => Some(ReplyData::MotorMode(servo.motor_mode)),
        Opcode::TempMaxLimitRead => Some(ReplyData::TempMaxLimit(servo.temperature_limit_c)),
        Opcode::VinLimitRead => Some(ReplyData::VinLimits {
            min_mv: servo.voltage_limits.0,
            max_mv: servo.voltage_limits.1,
        }),
        Opcode::MoveTimeRead => Some(ReplyData::MoveTime {
            position: servo.target.round() as u16,
            time_ms: servo.move_duration.as_millis().min(u16::MAX as u128) as u16,
        }),
        _ => None,
    }
}

/// Parse a command frame the way a servo would.
fn parse_command(frame: &[u8]) -> Option<SentCommand> {
    if frame.len() < HEADER.len() + 4 || frame[..2] != HEADER {
        return None;
    }
    let length = frame[3];
    if length < MIN_LENGTH || frame.len() != length as usize + 3 {
        return None;
    }
    let body = &frame[2..frame.len() - 1];
    if checksum(body) != frame[frame.len() - 1] {
        return None;
    }
    Some(SentCommand {
        id: body[0],
        opcode: Opcode::from_byte(body[2])?,
        params: body[3..].to_vec(),
    })
}

/// In-process servo bus.
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

/// Shared view of a [`SimulatedBus`] for inspection and fault injection.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    /// Create a bus populated with `servos`, returning the bus and a handle to it.
    pub fn new(servos: impl IntoIterator<Item = SimServo>) -> (Self, SimHandle) {
        let state = BusState {
            servos: servos.into_iter().map(|s| (s.id, s)).collect(),
            ..Default::default()
        };
        let state = Arc::new(Mutex::new(state));
        (
            Self {
                state: state.clone(),
            },
            SimHandle { state },
        )
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for SimulatedBus {
    fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()> {
        let mut state = self.lock();
        if state.faults.write_error {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "adapter unplugged").into());
        }
        state.handle(frame);
        Ok(())
    }

    fn read_frame(&mut self, _timeout: Duration) -> TransportResult<Vec<u8>> {
        self.lock().pending.pop_front().ok_or(TransportError::Timeout)
    }

    fn clear_input(&mut self) -> TransportResult<()> {
        self.lock().pending.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.lock().closed = true;
    }
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open another bus over the same servos, as a reconnect would.
    pub fn bus(&self) -> SimulatedBus {
        let mut state = self.lock();
        state.closed = false;
        state.pending.clear();
        drop(state);
        SimulatedBus {
            state: self.state.clone(),
        }
    }

    /// Every command frame written so far, in order.
    pub fn sent(&self) -> Vec<SentCommand> {
        self.lock().sent.clone()
    }

    /// Commands written so far, draining the record.
    pub fn take_sent(&self) -> Vec<SentCommand> {
        std::mem::take(&mut self.lock().sent)
    }

    /// MOVE_TIME_WRITE targets sent to `id`, in order.
    pub fn move_targets(&self, id: u8) -> Vec<u16> {
        self.lock()
            .sent
            .iter()
            .filter(|c| c.id == id)
            .filter_map(SentCommand::move_target)
            .collect()
    }

    /// Run `f` against the model of servo `id`.
    ///
    /// # Panics
    ///
    /// Panics if no servo with that ID is on the bus.
    pub fn with_servo<R>(&self, id: u8, f: impl FnOnce(&mut SimServo) -> R) -> R {
        let mut state = self.lock();
        let servo = state
            .servos
            .get_mut(&id)
            .unwrap_or_else(|| panic!("no simulated servo with id {id}"));
        f(servo)
    }

    /// Present position of servo `id`.
    pub fn position(&self, id: u8) -> i32 {
        self.with_servo(id, |s| s.position())
    }

    /// Queue scripted position replies for servo `id`.
    pub fn script_positions(&self, id: u8, positions: &[i16]) {
        self.with_servo(id, |s| s.scripted_positions.extend(positions.iter().copied()));
    }

    /// Make servo `id` stop (or resume) replying.
    pub fn set_silent(&self, id: u8, silent: bool) {
        self.with_servo(id, |s| s.silent = silent);
    }

    /// Drop the next `count` replies from any servo.
    pub fn drop_next_replies(&self, count: usize) {
        self.lock().faults.drop_replies = count;
    }

    /// Corrupt the checksum of the next `count` replies from any servo.
    pub fn corrupt_next_replies(&self, count: usize) {
        self.lock().faults.corrupt_replies = count;
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn fail_writes(&self) {
        self.lock().faults.write_error = true;
    }

    /// Push raw bytes into the receive queue.
    pub fn inject_reply(&self, frame: Vec<u8>) {
        self.lock().pending.push_back(frame);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
