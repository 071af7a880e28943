//! Motion sequencing for the focuser and zoom axes.
//!
//! The [`MotionController`] owns one [`ServoProxy`] per role and turns
//! intents (raw moves, calibrated moves, nudges, homing) into short bus
//! transactions. Anything longer than a single exchange runs as a procedure:
//! a small step machine that issues one command or one read per step and
//! then yields until its next wake time. The owner calls [`MotionController::poll`]
//! whenever a wake time is due, so other requests can use the bus between
//! steps and a cancel flag can be honored before each one.
//!
//! Per-role state machine:
//!
//! ```text
//! Unhomed --home--> Homing --stable--> Ready --move--> Moving --confirmed/timeout--> Ready
//!                      |                 |                |
//!                      +--failed/cancel--+> Unhomed       +--stop/cancel--> Stopped
//! Ready --stop--> Stopped --move--> Moving
//! ```

use std::collections::VecDeque;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hardware::hiwonder::{
    LinkHealth, LinkSession, ServoError, ServoIdentity, ServoProxy, ServoRole, TransportError,
};
use strum::{Display, IntoEnumIterator};
use tracing::{debug, info, warn};

use crate::calibration::CalibrationCurve;
use crate::config::{ServoSettings, Settings};
use crate::error::{ControlError, ControlResult};

/// Per-role state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AxisState {
    Unhomed,
    Homing,
    Ready,
    Moving,
    Stopped,
}

/// One value per servo role.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerRole<T> {
    pub focuser: T,
    pub zoom: T,
}

impl<T> PerRole<T> {
    pub fn new(focuser: T, zoom: T) -> Self {
        Self { focuser, zoom }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServoRole, &T)> {
        [(ServoRole::Focuser, &self.focuser), (ServoRole::Zoom, &self.zoom)].into_iter()
    }
}

impl<T> Index<ServoRole> for PerRole<T> {
    type Output = T;

    fn index(&self, role: ServoRole) -> &T {
        match role {
            ServoRole::Focuser => &self.focuser,
            ServoRole::Zoom => &self.zoom,
        }
    }
}

impl<T> IndexMut<ServoRole> for PerRole<T> {
    fn index_mut(&mut self, role: ServoRole) -> &mut T {
        match role {
            ServoRole::Focuser => &mut self.focuser,
            ServoRole::Zoom => &mut self.zoom,
        }
    }
}

/// What a move request asked for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveTarget {
    Raw(i32),
    Logical(f64),
    Nudge(i32),
}

/// A change the controller made to a requested target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    /// Raw target was outside the travel limits.
    Clamped { requested: i32, used: i32 },
    /// Logical target was beyond the calibration curve.
    Boundary { requested: f64, used: f64 },
}

/// Answer to an accepted move.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveReport {
    pub role: ServoRole,
    pub requested: MoveTarget,
    /// Final raw target the axis is moving to.
    pub target_raw: i32,
    pub adjustment: Option<Adjustment>,
    /// Number of commands the move is split into.
    pub waypoints: usize,
    /// Velocity used, counts per second.
    pub velocity: f64,
}

/// How the last procedure on an axis ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureOutcome {
    Reached { raw: i32 },
    /// Target not confirmed within the move timeout.
    TimedOut { target: i32, last: Option<i32> },
    Homed { reference: i32 },
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ProcedureKind {
    Move,
    Homing,
}

/// A procedure that has run to completion or been aborted.
#[derive(Debug)]
pub struct Finished {
    pub role: ServoRole,
    pub kind: ProcedureKind,
    pub result: ControlResult<ProcedureOutcome>,
}

/// Snapshot of an axis for callers.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionEstimate {
    pub role: ServoRole,
    pub id: u8,
    pub enabled: bool,
    pub state: AxisState,
    /// Last confirmed raw position.
    pub raw: Option<i32>,
    /// Logical value of `raw` through the calibration curve.
    pub logical: Option<f64>,
    /// Target of the move in progress.
    pub target: Option<i32>,
    pub offset_from_home: Option<i32>,
    pub health: LinkHealth,
    pub age: Option<Duration>,
    pub temperature_c: Option<i8>,
    pub voltage_mv: Option<u16>,
    pub last_outcome: Option<ProcedureOutcome>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Issue { not_before: Instant },
    Confirm { at: Instant },
}

impl Phase {
    fn wake(&self) -> Instant {
        match *self {
            Phase::Issue { not_before } => not_before,
            Phase::Confirm { at } => at,
        }
    }
}

#[derive(Debug)]
struct MovePlan {
    target: i32,
    waypoints: VecDeque<i32>,
    velocity: f64,
    phase: Phase,
    waypoint_started: Instant,
}

#[derive(Debug)]
struct HomingPlan {
    steps: u32,
    previous: Option<i32>,
    phase: Phase,
}

#[derive(Debug)]
enum Procedure {
    Move(MovePlan),
    Homing(HomingPlan),
}

impl Procedure {
    fn kind(&self) -> ProcedureKind {
        match self {
            Procedure::Move(_) => ProcedureKind::Move,
            Procedure::Homing(_) => ProcedureKind::Homing,
        }
    }

    fn wake(&self) -> Instant {
        match self {
            Procedure::Move(plan) => plan.phase.wake(),
            Procedure::Homing(plan) => plan.phase.wake(),
        }
    }
}

enum Step {
    Continue(Procedure),
    Done(ControlResult<ProcedureOutcome>),
}

/// Split a move into commands no more than `max_step` apart.
pub fn plan_waypoints(from: i32, to: i32, max_step: i32) -> VecDeque<i32> {
    let max_step = max_step.max(1);
    let mut points = VecDeque::new();
    let mut at = from;
    while (to - at).abs() > max_step {
        at += max_step * (to - at).signum();
        points.push_back(at);
    }
    points.push_back(to);
    points
}

struct Axis {
    proxy: ServoProxy,
    settings: ServoSettings,
    calibration: Option<Arc<CalibrationCurve>>,
    state: AxisState,
    procedure: Option<Procedure>,
    last_command: Option<Instant>,
    home: Option<i32>,
    last_outcome: Option<ProcedureOutcome>,
    /// Whether torque is known to be on.
    torque_held: bool,
}

impl Axis {
    fn new(role: ServoRole, settings: &ServoSettings, stale_after: Duration) -> Self {
        let proxy = ServoProxy::new(
            ServoIdentity {
                id: settings.id,
                role,
            },
            settings.limits,
        )
        .with_stale_after(stale_after);
        Self {
            proxy,
            calibration: settings.calibration.clone().map(Arc::new),
            settings: settings.clone(),
            state: AxisState::Unhomed,
            procedure: None,
            last_command: None,
            home: None,
            last_outcome: None,
            torque_held: false,
        }
    }

    fn role(&self) -> ServoRole {
        self.proxy.role()
    }

    fn set_state(&mut self, state: AxisState) {
        if self.state != state {
            info!("{}: {} -> {}", self.proxy.identity(), self.state, state);
            self.state = state;
        }
    }

    /// Earliest instant the next command may go out.
    fn next_command_slot(&self, now: Instant) -> Instant {
        match self.last_command {
            Some(at) => (at + self.settings.min_command_interval()).max(now),
            None => now,
        }
    }

    fn check_enabled(&self) -> ControlResult<()> {
        if self.settings.enabled {
            Ok(())
        } else {
            Err(ControlError::RoleDisabled(self.role()))
        }
    }

    fn check_can_move(&self) -> ControlResult<()> {
        self.check_enabled()?;
        match self.state {
            AxisState::Ready | AxisState::Stopped | AxisState::Moving => Ok(()),
            state => Err(ControlError::InvalidState {
                role: self.role(),
                state,
                action: "move",
            }),
        }
    }

    /// Enable torque unless it is already held. A servo without torque
    /// ignores position commands.
    fn ensure_torque(&mut self, link: &mut LinkSession) -> Result<(), ServoError> {
        if !self.torque_held {
            self.proxy.set_torque(link, true)?;
            self.torque_held = true;
        }
        Ok(())
    }

    fn set_torque(&mut self, link: &mut LinkSession, enabled: bool) -> Result<(), ServoError> {
        // Unknown until the write lands.
        self.torque_held = false;
        self.proxy.set_torque(link, enabled)?;
        self.torque_held = enabled;
        Ok(())
    }

    /// Release torque after a finished procedure when configured to.
    fn release_if_configured(&mut self, link: &mut LinkSession, result: &ControlResult<ProcedureOutcome>) {
        if !self.settings.release_after_move || link.is_failed() {
            return;
        }
        if matches!(
            result,
            Ok(ProcedureOutcome::Reached { .. }
                | ProcedureOutcome::TimedOut { .. }
                | ProcedureOutcome::Homed { .. })
        ) {
            debug!("{}: releasing torque", self.proxy.identity());
            if let Err(e) = self.set_torque(link, false) {
                warn!("{}: could not release torque: {}", self.proxy.identity(), e);
            }
        }
    }

    fn servo_err(&self, err: ServoError) -> ControlError {
        ControlError::from_servo(self.role(), err)
    }

    fn move_target(&self) -> Option<i32> {
        match &self.procedure {
            Some(Procedure::Move(plan)) => Some(plan.target),
            _ => None,
        }
    }

    fn estimate(&self) -> PositionEstimate {
        let snapshot = self.proxy.snapshot();
        PositionEstimate {
            role: self.role(),
            id: self.proxy.id(),
            enabled: self.settings.enabled,
            state: self.state,
            raw: snapshot.position,
            logical: match (&self.calibration, snapshot.position) {
                (Some(curve), Some(raw)) => Some(curve.inverse(raw)),
                _ => None,
            },
            target: self.move_target(),
            offset_from_home: self.home.zip(snapshot.position).map(|(h, p)| p - h),
            health: snapshot.health,
            age: snapshot.age,
            temperature_c: snapshot.temperature_c,
            voltage_mv: snapshot.voltage_mv,
            last_outcome: self.last_outcome.clone(),
        }
    }

    fn finish(&mut self, kind: ProcedureKind, result: ControlResult<ProcedureOutcome>) -> Finished {
        self.last_outcome = Some(match &result {
            Ok(outcome) => outcome.clone(),
            Err(ControlError::Cancelled) => ProcedureOutcome::Cancelled,
            Err(e) => ProcedureOutcome::Failed(e.to_string()),
        });
        Finished {
            role: self.role(),
            kind,
            result,
        }
    }

    // ==================== Move steps ====================

    fn step_move(&mut self, link: &mut LinkSession, mut plan: MovePlan, now: Instant) -> Step {
        match plan.phase {
            Phase::Issue { .. } => {
                let Some(&waypoint) = plan.waypoints.front() else {
                    self.set_state(AxisState::Ready);
                    return Step::Done(Ok(ProcedureOutcome::Reached { raw: plan.target }));
                };
                let issued = self
                    .ensure_torque(link)
                    .and_then(|_| self.proxy.move_to(link, waypoint, Some(plan.velocity)));
                match issued {
                    Ok(outcome) => {
                        self.last_command = Some(now);
                        plan.waypoint_started = now;
                        plan.phase = Phase::Confirm {
                            at: now
                                + Duration::from_millis(outcome.time_ms as u64)
                                + self.settings.settle_time(),
                        };
                        Step::Continue(Procedure::Move(plan))
                    }
                    Err(e) => {
                        self.set_state(AxisState::Stopped);
                        Step::Done(Err(self.servo_err(e)))
                    }
                }
            }
            Phase::Confirm { .. } => {
                let waypoint = plan.waypoints.front().copied().unwrap_or(plan.target);
                let read = self.proxy.read_state(link);
                match read {
                    Ok(pos) if (pos - waypoint).abs() <= self.settings.position_tolerance => {
                        plan.waypoints.pop_front();
                        if plan.waypoints.is_empty() {
                            debug!("{}: reached {} (target {})", self.proxy.identity(), pos, plan.target);
                            self.set_state(AxisState::Ready);
                            return Step::Done(Ok(ProcedureOutcome::Reached { raw: pos }));
                        }
                        plan.phase = Phase::Issue {
                            not_before: self.next_command_slot(now),
                        };
                        Step::Continue(Procedure::Move(plan))
                    }
                    Err(ServoError::Transport(TransportError::LinkUnavailable(reason))) => {
                        self.set_state(AxisState::Stopped);
                        Step::Done(Err(ControlError::LinkUnavailable(reason)))
                    }
                    _ => {
                        if now.duration_since(plan.waypoint_started) >= self.settings.move_timeout() {
                            warn!(
                                "{}: move to {} not confirmed within {:?}",
                                self.proxy.identity(),
                                waypoint,
                                self.settings.move_timeout()
                            );
                            self.set_state(AxisState::Ready);
                            return Step::Done(Ok(ProcedureOutcome::TimedOut {
                                target: plan.target,
                                last: self.proxy.last_position(),
                            }));
                        }
                        plan.phase = Phase::Confirm {
                            at: now + self.settings.settle_time(),
                        };
                        Step::Continue(Procedure::Move(plan))
                    }
                }
            }
        }
    }

    // ==================== Homing steps ====================

    fn step_homing(&mut self, link: &mut LinkSession, mut plan: HomingPlan, now: Instant) -> Step {
        let role = self.role();
        match plan.phase {
            Phase::Issue { .. } => {
                let Some(from) = self.proxy.last_position() else {
                    plan.phase = Phase::Confirm { at: now };
                    return Step::Continue(Procedure::Homing(plan));
                };
                let target = from + self.settings.home_direction.sign() * self.settings.homing_step;
                let velocity = self.settings.homing_velocity;
                let issued = self
                    .ensure_torque(link)
                    .and_then(|_| self.proxy.move_to(link, target, Some(velocity)));
                match issued {
                    Ok(outcome) => {
                        self.last_command = Some(now);
                        plan.steps += 1;
                        plan.phase = Phase::Confirm {
                            at: now
                                + Duration::from_millis(outcome.time_ms as u64)
                                + self.settings.settle_time(),
                        };
                        Step::Continue(Procedure::Homing(plan))
                    }
                    Err(e) => {
                        self.set_state(AxisState::Unhomed);
                        Step::Done(Err(self.servo_err(e)))
                    }
                }
            }
            Phase::Confirm { .. } => {
                match self.proxy.read_state(link) {
                    Ok(pos) => {
                        if let Some(prev) = plan.previous {
                            if (pos - prev).abs() <= self.settings.position_tolerance {
                                info!("{}: homed at {}", self.proxy.identity(), pos);
                                self.home = Some(pos);
                                self.set_state(AxisState::Ready);
                                return Step::Done(Ok(ProcedureOutcome::Homed { reference: pos }));
                            }
                        }
                        plan.previous = Some(pos);
                    }
                    Err(ServoError::Transport(TransportError::LinkUnavailable(reason))) => {
                        self.set_state(AxisState::Unhomed);
                        return Step::Done(Err(ControlError::LinkUnavailable(reason)));
                    }
                    Err(e) => {
                        warn!("{}: homing read failed: {}", self.proxy.identity(), e);
                        plan.previous = None;
                        plan.steps += 1;
                        if plan.steps < self.settings.homing_max_attempts {
                            plan.phase = Phase::Confirm {
                                at: now + self.settings.settle_time(),
                            };
                            return Step::Continue(Procedure::Homing(plan));
                        }
                    }
                }

                if plan.steps >= self.settings.homing_max_attempts {
                    self.set_state(AxisState::Unhomed);
                    return Step::Done(Err(ControlError::HomingFailed {
                        role,
                        reason: format!(
                            "no stable position after {} attempts",
                            plan.steps
                        ),
                    }));
                }
                plan.phase = Phase::Issue {
                    not_before: self.next_command_slot(now),
                };
                Step::Continue(Procedure::Homing(plan))
            }
        }
    }

    fn step(&mut self, link: &mut LinkSession, now: Instant) -> Option<Finished> {
        let procedure = self.procedure.take()?;
        if procedure.wake() > now {
            self.procedure = Some(procedure);
            return None;
        }
        let kind = procedure.kind();
        let step = match procedure {
            Procedure::Move(plan) => self.step_move(link, plan, now),
            Procedure::Homing(plan) => self.step_homing(link, plan, now),
        };
        match step {
            Step::Continue(next) => {
                self.procedure = Some(next);
                None
            }
            Step::Done(result) => {
                self.release_if_configured(link, &result);
                Some(self.finish(kind, result))
            }
        }
    }

    /// Put the servo in a known configuration and take a first reading.
    fn initialize(&mut self, link: &mut LinkSession) -> Result<(), ServoError> {
        let limits = self.settings.limits;
        let (min, max) = limits.effective();
        self.proxy.set_servo_mode(link)?;
        self.proxy
            .set_temperature_limit(link, self.settings.temperature_limit_c)?;
        self.proxy
            .write_angle_limits(link, min.max(0) as u16, max.max(0) as u16)?;
        self.proxy.read_state(link)?;
        self.proxy.read_telemetry(link)?;
        self.set_torque(link, !self.settings.release_after_move)
    }
}

/// Sequences motion for both axes on one bus.
pub struct MotionController {
    axes: PerRole<Axis>,
}

impl MotionController {
    pub fn new(settings: &Settings) -> Self {
        let stale_after = settings.stale_after();
        Self {
            axes: PerRole::new(
                Axis::new(ServoRole::Focuser, &settings.focuser, stale_after),
                Axis::new(ServoRole::Zoom, &settings.zoom, stale_after),
            ),
        }
    }

    /// Configure every enabled servo (position mode, temperature cutoff and
    /// angle limits), read it and settle initial states. Axes that release
    /// torque after a move start released; the others hold.
    ///
    /// Fails only if the link itself fails. A servo that does not answer
    /// stays `Unhomed` with unknown health.
    pub fn initialize(&mut self, link: &mut LinkSession) -> ControlResult<()> {
        for role in ServoRole::iter() {
            let axis = &mut self.axes[role];
            if !axis.settings.enabled {
                continue;
            }
            match axis.initialize(link) {
                Ok(()) => {
                    axis.set_state(if axis.settings.require_homing {
                        AxisState::Unhomed
                    } else {
                        AxisState::Ready
                    });
                }
                Err(ServoError::Transport(TransportError::LinkUnavailable(reason))) => {
                    return Err(ControlError::LinkUnavailable(reason));
                }
                Err(e) => warn!("{}: not responding at connect: {}", axis.proxy.identity(), e),
            }
        }
        Ok(())
    }

    pub fn status(&self, role: ServoRole) -> PositionEstimate {
        self.axes[role].estimate()
    }

    /// Read the position now and return the fresh estimate.
    pub fn refresh(&mut self, link: &mut LinkSession, role: ServoRole) -> ControlResult<PositionEstimate> {
        let axis = &mut self.axes[role];
        axis.check_enabled()?;
        axis.proxy
            .read_state(link)
            .map_err(|e| ControlError::from_servo(role, e))?;
        if axis.state == AxisState::Unhomed && !axis.settings.require_homing {
            axis.set_state(AxisState::Ready);
        }
        Ok(axis.estimate())
    }

    /// Whether any procedure is in progress.
    pub fn is_busy(&self) -> bool {
        self.axes.iter().any(|(_, axis)| axis.procedure.is_some())
    }

    pub fn is_idle(&self, role: ServoRole) -> bool {
        self.axes[role].procedure.is_none()
    }

    /// Earliest wake time over all procedures.
    pub fn next_wake(&self) -> Option<Instant> {
        self.axes
            .iter()
            .filter_map(|(_, axis)| axis.procedure.as_ref().map(Procedure::wake))
            .min()
    }

    /// Swap a role's calibration curve as a whole.
    pub fn replace_calibration(&mut self, role: ServoRole, curve: Option<Arc<CalibrationCurve>>) {
        info!("{}: calibration replaced", role);
        self.axes[role].calibration = curve;
    }

    // ==================== Moves ====================

    /// Accept a raw move. The first command goes out at once unless the
    /// command interval defers it.
    pub fn move_to_raw(
        &mut self,
        link: &mut LinkSession,
        role: ServoRole,
        raw: i32,
        velocity: Option<f64>,
        now: Instant,
    ) -> ControlResult<(MoveReport, Option<Finished>)> {
        self.begin_move(link, role, MoveTarget::Raw(raw), raw, None, velocity, now)
    }

    /// Accept a move to a calibrated logical value.
    pub fn move_to_logical(
        &mut self,
        link: &mut LinkSession,
        role: ServoRole,
        value: f64,
        velocity: Option<f64>,
        now: Instant,
    ) -> ControlResult<(MoveReport, Option<Finished>)> {
        let axis = &self.axes[role];
        axis.check_can_move()?;
        let curve = axis
            .calibration
            .as_ref()
            .ok_or_else(|| ControlError::CalibrationOutOfRange {
                role,
                target: value,
                reason: "no calibration curve configured".into(),
            })?;
        let lookup = curve
            .lookup(value)
            .map_err(|e| ControlError::CalibrationOutOfRange {
                role,
                target: value,
                reason: e.to_string(),
            })?;
        let adjustment = lookup.boundary.map(|b| {
            warn!("{}: {} is beyond calibration, using {}", role, b.requested, b.used);
            Adjustment::Boundary {
                requested: b.requested,
                used: b.used,
            }
        });
        self.begin_move(
            link,
            role,
            MoveTarget::Logical(value),
            lookup.raw,
            adjustment,
            velocity,
            now,
        )
    }

    /// Zoom to a focal length in millimetres.
    pub fn set_focal_length(
        &mut self,
        link: &mut LinkSession,
        mm: f64,
        velocity: Option<f64>,
        now: Instant,
    ) -> ControlResult<(MoveReport, Option<Finished>)> {
        self.move_to_logical(link, ServoRole::Zoom, mm, velocity, now)
    }

    /// Move the focuser to a calibrated focus offset.
    pub fn set_focus_offset(
        &mut self,
        link: &mut LinkSession,
        offset: f64,
        velocity: Option<f64>,
        now: Instant,
    ) -> ControlResult<(MoveReport, Option<Finished>)> {
        self.move_to_logical(link, ServoRole::Focuser, offset, velocity, now)
    }

    /// Relative move. Rejected outright if it would leave the limits.
    pub fn nudge(
        &mut self,
        link: &mut LinkSession,
        role: ServoRole,
        delta: i32,
        velocity: Option<f64>,
        now: Instant,
    ) -> ControlResult<(MoveReport, Option<Finished>)> {
        let axis = &mut self.axes[role];
        axis.check_can_move()?;
        let base = match (axis.move_target(), axis.proxy.last_position()) {
            (Some(target), _) => target,
            (None, Some(pos)) => pos,
            (None, None) => axis
                .proxy
                .read_state(link)
                .map_err(|e| ControlError::from_servo(role, e))?,
        };
        let limits = axis.settings.limits;
        let target = base.saturating_add(delta);
        if target < limits.min || target > limits.max {
            return Err(ControlError::LimitReached {
                role,
                current: base,
                delta,
                min: limits.min,
                max: limits.max,
            });
        }
        self.begin_move(link, role, MoveTarget::Nudge(delta), target, None, velocity, now)
    }

    pub fn nudge_focuser(
        &mut self,
        link: &mut LinkSession,
        delta: i32,
        velocity: Option<f64>,
        now: Instant,
    ) -> ControlResult<(MoveReport, Option<Finished>)> {
        self.nudge(link, ServoRole::Focuser, delta, velocity, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn begin_move(
        &mut self,
        link: &mut LinkSession,
        role: ServoRole,
        requested: MoveTarget,
        raw: i32,
        adjustment: Option<Adjustment>,
        velocity: Option<f64>,
        now: Instant,
    ) -> ControlResult<(MoveReport, Option<Finished>)> {
        let axis = &mut self.axes[role];
        axis.check_can_move()?;

        let (target, clamped) = axis.settings.limits.clamp(raw);
        let adjustment = if clamped {
            warn!("{}: target {} clamped to {}", role, raw, target);
            Some(Adjustment::Clamped {
                requested: raw,
                used: target,
            })
        } else {
            adjustment
        };

        let max_velocity = axis.settings.max_velocity;
        let velocity = match velocity {
            Some(v) if !(v.is_finite() && v > 0.0) => {
                return Err(ControlError::InvalidArgument(format!(
                    "velocity must be positive, got {v}"
                )))
            }
            Some(v) => v.min(max_velocity),
            None => max_velocity,
        };

        let waypoints = match axis.proxy.last_position() {
            Some(from) => plan_waypoints(from, target, axis.settings.limits.max_step),
            None => VecDeque::from([target]),
        };
        let report = MoveReport {
            role,
            requested,
            target_raw: target,
            adjustment,
            waypoints: waypoints.len(),
            velocity,
        };

        if axis.procedure.is_some() {
            debug!("{}: new target {} supersedes move in progress", role, target);
        }
        axis.procedure = Some(Procedure::Move(MovePlan {
            target,
            waypoints,
            velocity,
            phase: Phase::Issue {
                not_before: axis.next_command_slot(now),
            },
            waypoint_started: now,
        }));
        axis.set_state(AxisState::Moving);

        match axis.step(link, now) {
            Some(Finished { result: Err(e), .. }) => Err(e),
            finished => Ok((report, finished)),
        }
    }

    // ==================== Homing ====================

    /// Start homing `role`. Completion is reported through [`Self::poll`].
    pub fn start_homing(&mut self, role: ServoRole, now: Instant) -> ControlResult<()> {
        let axis = &mut self.axes[role];
        axis.check_enabled()?;
        match axis.state {
            AxisState::Unhomed | AxisState::Ready | AxisState::Stopped => {}
            state => {
                return Err(ControlError::InvalidState {
                    role,
                    state,
                    action: "home",
                })
            }
        }
        axis.home = None;
        axis.procedure = Some(Procedure::Homing(HomingPlan {
            steps: 0,
            previous: None,
            phase: Phase::Confirm { at: now },
        }));
        axis.set_state(AxisState::Homing);
        Ok(())
    }

    // ==================== Stepping ====================

    /// Run every procedure step that is due. Checks `cancel` before each
    /// step and stops early once it is set.
    pub fn poll(&mut self, link: &mut LinkSession, now: Instant, cancel: &AtomicBool) -> Vec<Finished> {
        let mut finished = Vec::new();
        for role in ServoRole::iter() {
            if cancel.load(Ordering::SeqCst) || link.is_failed() {
                break;
            }
            if let Some(done) = self.axes[role].step(link, now) {
                finished.push(done);
            }
        }
        finished
    }

    /// Send MOVE_STOP to every enabled servo. Tries all servos even if one
    /// fails and returns the first error.
    pub fn stop_all(&mut self, link: &mut LinkSession) -> ControlResult<()> {
        let mut first_error = None;
        for role in ServoRole::iter() {
            let axis = &mut self.axes[role];
            if !axis.settings.enabled {
                continue;
            }
            if let Err(e) = axis.proxy.stop(link) {
                first_error.get_or_insert(ControlError::from_servo(role, e));
            }
            match axis.state {
                AxisState::Ready | AxisState::Moving => axis.set_state(AxisState::Stopped),
                AxisState::Homing => axis.set_state(AxisState::Unhomed),
                AxisState::Unhomed | AxisState::Stopped => {}
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Abort every procedure, leaving axes at their last confirmed position.
    pub fn abort_all(&mut self, reason: impl Fn() -> ControlError) -> Vec<Finished> {
        let mut finished = Vec::new();
        for role in ServoRole::iter() {
            let axis = &mut self.axes[role];
            let Some(procedure) = axis.procedure.take() else {
                continue;
            };
            match procedure {
                Procedure::Move(_) => axis.set_state(AxisState::Stopped),
                Procedure::Homing(_) => axis.set_state(AxisState::Unhomed),
            }
            finished.push(axis.finish(procedure.kind(), Err(reason())));
        }
        finished
    }

    // ==================== Upkeep ====================

    /// Refresh temperature and voltage for roles that are due, at most once
    /// per `interval` and less often while a servo keeps failing to answer.
    /// A silent servo never drops the link; only a link failure is an error.
    pub fn refresh_telemetry(&mut self, link: &mut LinkSession, interval: Duration) -> ControlResult<()> {
        for role in ServoRole::iter() {
            let axis = &mut self.axes[role];
            if !axis.settings.enabled || !axis.proxy.telemetry_due(interval) {
                continue;
            }
            if let Err(e) = axis.proxy.poll_telemetry(link) {
                return Err(ControlError::from_servo(role, e));
            }
        }
        Ok(())
    }

    /// Release holding torque on every enabled servo.
    pub fn release(&mut self, link: &mut LinkSession) {
        for role in ServoRole::iter() {
            let axis = &mut self.axes[role];
            if !axis.settings.enabled {
                continue;
            }
            if let Err(e) = axis.set_torque(link, false) {
                warn!("{}: could not release torque: {}", axis.proxy.identity(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Anchor;
    use hardware::hiwonder::{
        LinkParams, MotorMode, Opcode, SimHandle, SimServo, SimulatedBus, TravelLimits,
    };

    const ZOOM: u8 = 1;
    const FOCUSER: u8 = 2;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        for servo in [&mut settings.focuser, &mut settings.zoom] {
            servo.limits = TravelLimits::new(50, 950, 1000);
            servo.max_velocity = 100_000.0;
            servo.homing_velocity = 100_000.0;
            servo.homing_step = 100;
            servo.homing_max_attempts = 12;
            servo.settle_time_ms = 0;
            servo.min_command_interval_ms = 0;
            servo.move_timeout_ms = 200;
            servo.position_tolerance = 5;
            servo.require_homing = false;
        }
        settings.zoom.calibration = Some(
            CalibrationCurve::new(vec![Anchor::new(8.0, 100), Anchor::new(24.0, 900)]).unwrap(),
        );
        settings
    }

    fn rig(settings: &Settings, servos: Vec<SimServo>) -> (MotionController, LinkSession, SimHandle) {
        let (bus, handle) = SimulatedBus::new(servos);
        let mut link = LinkSession::new(Box::new(bus), LinkParams::new("sim"));
        let mut motion = MotionController::new(settings);
        motion.initialize(&mut link).unwrap();
        handle.take_sent();
        (motion, link, handle)
    }

    /// Poll until the role is idle, with a bounded number of rounds.
    fn run_until_idle(motion: &mut MotionController, link: &mut LinkSession, role: ServoRole) -> Vec<Finished> {
        let cancel = AtomicBool::new(false);
        let mut finished = Vec::new();
        for _ in 0..500 {
            if motion.is_idle(role) {
                break;
            }
            finished.extend(motion.poll(link, Instant::now(), &cancel));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(motion.is_idle(role), "{role} still busy");
        finished
    }

    #[test]
    fn test_plan_waypoints() {
        assert_eq!(plan_waypoints(100, 350, 100), VecDeque::from([200, 300, 350]));
        assert_eq!(plan_waypoints(500, 250, 100), VecDeque::from([400, 300, 250]));
        assert_eq!(plan_waypoints(500, 560, 100), VecDeque::from([560]));
        assert_eq!(plan_waypoints(500, 500, 100), VecDeque::from([500]));
    }

    #[test]
    fn test_initialize_sets_states_from_homing_requirement() {
        let mut s = settings();
        s.focuser.require_homing = true;
        let (motion, _link, handle) = rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        assert_eq!(motion.status(ServoRole::Zoom).state, AxisState::Ready);
        assert_eq!(motion.status(ServoRole::Focuser).state, AxisState::Unhomed);
        assert_eq!(motion.status(ServoRole::Focuser).raw, Some(400));
        assert!(handle.with_servo(FOCUSER, |s| s.torque_enabled));
        assert!(!handle.with_servo(ZOOM, |s| s.torque_enabled));
    }

    #[test]
    fn test_initialize_configures_servos() {
        let s = settings();
        let (bus, handle) = SimulatedBus::new(vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);
        let mut link = LinkSession::new(Box::new(bus), LinkParams::new("sim"));
        let mut motion = MotionController::new(&s);
        motion.initialize(&mut link).unwrap();

        let opcodes: Vec<Opcode> = handle
            .sent()
            .iter()
            .filter(|c| c.id == FOCUSER)
            .map(|c| c.opcode)
            .collect();
        assert_eq!(
            &opcodes[..3],
            &[Opcode::MotorModeWrite, Opcode::TempMaxLimitWrite, Opcode::AngleLimitWrite]
        );
        handle.with_servo(FOCUSER, |servo| {
            assert_eq!(servo.motor_mode, MotorMode::Servo);
            assert_eq!(servo.temperature_limit_c, 100);
            assert_eq!(servo.angle_limits, (50, 950));
        });
    }

    #[test]
    fn test_servo_left_in_motor_mode_still_moves() {
        let s = settings();
        let mut focuser = SimServo::new(FOCUSER, 400);
        focuser.motor_mode = MotorMode::Motor { speed: 0 };
        let (mut motion, mut link, handle) = rig(&s, vec![SimServo::new(ZOOM, 300), focuser]);

        assert_eq!(handle.with_servo(FOCUSER, |s| s.motor_mode), MotorMode::Servo);
        motion
            .move_to_raw(&mut link, ServoRole::Focuser, 600, None, Instant::now())
            .unwrap();
        let finished = run_until_idle(&mut motion, &mut link, ServoRole::Focuser);
        assert!(matches!(
            finished[0].result,
            Ok(ProcedureOutcome::Reached { raw: 600 })
        ));
    }

    #[test]
    fn test_zoom_releases_torque_after_move() {
        let s = settings();
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        motion
            .move_to_raw(&mut link, ServoRole::Zoom, 600, None, Instant::now())
            .unwrap();
        assert!(handle.with_servo(ZOOM, |s| s.torque_enabled));
        run_until_idle(&mut motion, &mut link, ServoRole::Zoom);
        assert!(!handle.with_servo(ZOOM, |s| s.torque_enabled));
        assert_eq!(handle.position(ZOOM), 600);

        motion
            .move_to_raw(&mut link, ServoRole::Focuser, 600, None, Instant::now())
            .unwrap();
        run_until_idle(&mut motion, &mut link, ServoRole::Focuser);
        assert!(handle.with_servo(FOCUSER, |s| s.torque_enabled));

        let torque_writes = handle
            .sent()
            .iter()
            .filter(|c| c.opcode == Opcode::LoadOrUnloadWrite)
            .count();
        assert_eq!(torque_writes, 2);
    }

    #[test]
    fn test_telemetry_refresh_tolerates_absent_servo() {
        let s = settings();
        let (mut motion, mut link, handle) = rig(&s, vec![SimServo::new(ZOOM, 300)]);

        for _ in 0..10 {
            motion.refresh_telemetry(&mut link, Duration::ZERO).unwrap();
        }
        assert!(!link.is_failed());
        assert_eq!(motion.status(ServoRole::Zoom).temperature_c, Some(28));
        assert_eq!(motion.status(ServoRole::Focuser).temperature_c, None);

        handle.take_sent();
        motion
            .refresh_telemetry(&mut link, Duration::from_secs(3600))
            .unwrap();
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn test_focal_length_move_confirms_and_reports() {
        let s = settings();
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        let (report, finished) = motion
            .set_focal_length(&mut link, 16.0, None, Instant::now())
            .unwrap();
        assert!(finished.is_none());
        assert_eq!(report.target_raw, 500);
        assert_eq!(report.adjustment, None);
        assert_eq!(handle.move_targets(ZOOM), vec![500]);
        assert_eq!(motion.status(ServoRole::Zoom).state, AxisState::Moving);

        handle.script_positions(ZOOM, &[498]);
        let finished = run_until_idle(&mut motion, &mut link, ServoRole::Zoom);
        assert!(matches!(
            finished[0].result,
            Ok(ProcedureOutcome::Reached { raw: 498 })
        ));

        let status = motion.status(ServoRole::Zoom);
        assert_eq!(status.state, AxisState::Ready);
        assert_eq!(status.raw, Some(498));
        approx::assert_relative_eq!(status.logical.unwrap(), 15.96, epsilon = 1e-9);
    }

    #[test]
    fn test_logical_target_beyond_curve_reports_boundary() {
        let s = settings();
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        let (report, _) = motion
            .set_focal_length(&mut link, 30.0, None, Instant::now())
            .unwrap();
        assert_eq!(report.target_raw, 900);
        assert_eq!(
            report.adjustment,
            Some(Adjustment::Boundary {
                requested: 30.0,
                used: 24.0
            })
        );
        assert_eq!(handle.move_targets(ZOOM), vec![900]);
    }

    #[test]
    fn test_missing_curve_is_calibration_error() {
        let s = settings();
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        let err = motion
            .set_focus_offset(&mut link, 1.0, None, Instant::now())
            .unwrap_err();
        assert!(matches!(err, ControlError::CalibrationOutOfRange { .. }));
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn test_raw_move_clamps_to_limits() {
        let s = settings();
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        let (report, _) = motion
            .move_to_raw(&mut link, ServoRole::Focuser, 1200, None, Instant::now())
            .unwrap();
        assert_eq!(
            report.adjustment,
            Some(Adjustment::Clamped {
                requested: 1200,
                used: 950
            })
        );
        assert_eq!(handle.move_targets(FOCUSER), vec![950]);
    }

    #[test]
    fn test_nudge_past_limit_is_rejected_without_traffic() {
        let s = settings();
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 900)]);

        let err = motion
            .nudge_focuser(&mut link, 2000, None, Instant::now())
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::LimitReached {
                current: 900,
                delta: 2000,
                max: 950,
                ..
            }
        ));
        assert!(handle.sent().is_empty());
        assert_eq!(motion.status(ServoRole::Focuser).raw, Some(900));
        assert_eq!(motion.status(ServoRole::Focuser).state, AxisState::Ready);
    }

    #[test]
    fn test_long_move_is_split_into_waypoints() {
        let mut s = settings();
        s.focuser.limits.max_step = 150;
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 100)]);

        let (report, _) = motion
            .move_to_raw(&mut link, ServoRole::Focuser, 500, None, Instant::now())
            .unwrap();
        assert_eq!(report.waypoints, 3);
        run_until_idle(&mut motion, &mut link, ServoRole::Focuser);

        assert_eq!(handle.move_targets(FOCUSER), vec![250, 400, 500]);
        assert_eq!(motion.status(ServoRole::Focuser).raw, Some(500));
    }

    #[test]
    fn test_velocity_is_capped() {
        let mut s = settings();
        s.focuser.max_velocity = 200.0;
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        let (report, _) = motion
            .move_to_raw(&mut link, ServoRole::Focuser, 500, Some(5000.0), Instant::now())
            .unwrap();
        assert_eq!(report.velocity, 200.0);
        let sent = handle.sent();
        assert_eq!(sent.last().unwrap().move_time_ms(), Some(500));

        assert!(matches!(
            motion.move_to_raw(&mut link, ServoRole::Focuser, 500, Some(-1.0), Instant::now()),
            Err(ControlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_command_interval_defers_issue() {
        let mut s = settings();
        s.zoom.min_command_interval_ms = 60_000;
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        let now = Instant::now();
        motion.move_to_raw(&mut link, ServoRole::Zoom, 400, None, now).unwrap();
        motion.move_to_raw(&mut link, ServoRole::Zoom, 600, None, now).unwrap();

        assert_eq!(handle.move_targets(ZOOM), vec![400]);
        assert_eq!(motion.status(ServoRole::Zoom).target, Some(600));
        assert!(motion.next_wake().unwrap() >= now + Duration::from_secs(59));
    }

    #[test]
    fn test_unconfirmed_move_times_out() {
        let s = settings();
        let servo = SimServo::new(FOCUSER, 400).with_hard_stops(0, 450);
        let (mut motion, mut link, _handle) = rig(&s, vec![SimServo::new(ZOOM, 300), servo]);

        motion
            .move_to_raw(&mut link, ServoRole::Focuser, 800, None, Instant::now())
            .unwrap();
        let finished = run_until_idle(&mut motion, &mut link, ServoRole::Focuser);

        assert_eq!(
            finished[0].result.as_ref().unwrap(),
            &ProcedureOutcome::TimedOut {
                target: 800,
                last: Some(450)
            }
        );
        assert_eq!(motion.status(ServoRole::Focuser).state, AxisState::Ready);
    }

    #[test]
    fn test_moves_refused_until_homed() {
        let mut s = settings();
        s.focuser.require_homing = true;
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        let err = motion
            .move_to_raw(&mut link, ServoRole::Focuser, 500, None, Instant::now())
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidState {
                state: AxisState::Unhomed,
                ..
            }
        ));
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn test_homing_finds_mechanical_stop() {
        let mut s = settings();
        s.focuser.require_homing = true;
        let servo = SimServo::new(FOCUSER, 700).with_hard_stops(180, 1500);
        let (mut motion, mut link, _handle) = rig(&s, vec![SimServo::new(ZOOM, 300), servo]);

        motion.start_homing(ServoRole::Focuser, Instant::now()).unwrap();
        assert_eq!(motion.status(ServoRole::Focuser).state, AxisState::Homing);
        let finished = run_until_idle(&mut motion, &mut link, ServoRole::Focuser);

        assert_eq!(finished[0].kind, ProcedureKind::Homing);
        assert!(matches!(
            finished[0].result,
            Ok(ProcedureOutcome::Homed { reference: 180 })
        ));
        let status = motion.status(ServoRole::Focuser);
        assert_eq!(status.state, AxisState::Ready);
        assert_eq!(status.offset_from_home, Some(0));
    }

    #[test]
    fn test_homing_fails_on_unstable_position() {
        let mut s = settings();
        s.focuser.homing_max_attempts = 5;
        let servo = SimServo::new(FOCUSER, 700).with_jitter(20);
        let (mut motion, mut link, handle) = rig(&s, vec![SimServo::new(ZOOM, 300), servo]);
        handle.with_servo(FOCUSER, |s| s.hard_stops = (700, 700));

        motion.start_homing(ServoRole::Focuser, Instant::now()).unwrap();
        let finished = run_until_idle(&mut motion, &mut link, ServoRole::Focuser);

        assert!(matches!(
            finished[0].result,
            Err(ControlError::HomingFailed { .. })
        ));
        assert_eq!(motion.status(ServoRole::Focuser).state, AxisState::Unhomed);
        let steps = handle
            .sent()
            .iter()
            .filter(|c| c.id == FOCUSER && c.opcode == Opcode::MoveTimeWrite)
            .count();
        assert_eq!(steps, 5);
    }

    #[test]
    fn test_home_refused_while_moving() {
        let s = settings();
        let (mut motion, mut link, _handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);
        motion
            .move_to_raw(&mut link, ServoRole::Focuser, 600, None, Instant::now())
            .unwrap();
        assert!(matches!(
            motion.start_homing(ServoRole::Focuser, Instant::now()),
            Err(ControlError::InvalidState {
                state: AxisState::Moving,
                ..
            })
        ));
    }

    #[test]
    fn test_abort_leaves_last_confirmed_state() {
        let s = settings();
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        motion
            .move_to_raw(&mut link, ServoRole::Zoom, 800, None, Instant::now())
            .unwrap();
        motion.start_homing(ServoRole::Focuser, Instant::now()).unwrap();

        motion.stop_all(&mut link).unwrap();
        let finished = motion.abort_all(|| ControlError::Cancelled);
        assert_eq!(finished.len(), 2);
        assert!(finished.iter().all(|f| matches!(f.result, Err(ControlError::Cancelled))));

        let zoom = motion.status(ServoRole::Zoom);
        assert_eq!(zoom.state, AxisState::Stopped);
        assert_eq!(zoom.raw, Some(300));
        assert_eq!(zoom.last_outcome, Some(ProcedureOutcome::Cancelled));
        assert_eq!(motion.status(ServoRole::Focuser).state, AxisState::Unhomed);

        let stops: Vec<u8> = handle
            .sent()
            .iter()
            .filter(|c| c.opcode == Opcode::MoveStop)
            .map(|c| c.id)
            .collect();
        assert_eq!(stops, vec![FOCUSER, ZOOM]);
    }

    #[test]
    fn test_poll_honors_cancel_flag() {
        let s = settings();
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);
        motion.start_homing(ServoRole::Focuser, Instant::now()).unwrap();

        let cancel = AtomicBool::new(true);
        assert!(motion.poll(&mut link, Instant::now(), &cancel).is_empty());
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn test_disabled_role_is_rejected() {
        let mut s = settings();
        s.focuser.enabled = false;
        let (mut motion, mut link, handle) = rig(&s, vec![SimServo::new(ZOOM, 300)]);

        assert!(matches!(
            motion.nudge_focuser(&mut link, 10, None, Instant::now()),
            Err(ControlError::RoleDisabled(ServoRole::Focuser))
        ));
        motion.stop_all(&mut link).unwrap();
        assert!(handle.sent().iter().all(|c| c.id == ZOOM));
    }

    #[test]
    fn test_replace_calibration_swaps_whole_curve() {
        let s = settings();
        let (mut motion, mut link, handle) =
            rig(&s, vec![SimServo::new(ZOOM, 300), SimServo::new(FOCUSER, 400)]);

        let curve =
            CalibrationCurve::new(vec![Anchor::new(8.0, 200), Anchor::new(24.0, 600)]).unwrap();
        motion.replace_calibration(ServoRole::Zoom, Some(Arc::new(curve)));
        motion
            .set_focal_length(&mut link, 16.0, None, Instant::now())
            .unwrap();
        assert_eq!(handle.move_targets(ZOOM), vec![400]);
    }
}
