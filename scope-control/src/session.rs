//! Session coordinator.
//!
//! One worker thread owns the bus link and the motion controller. Callers
//! talk to it through a [`Session`] handle: every request carries its own
//! typed reply channel, the worker serves requests in arrival order, and
//! blocking wrappers wait with a bound so a wedged bus never hangs a caller.
//!
//! Emergency stop bypasses the queue. Requesting one raises a shared flag
//! that the worker checks before every bus exchange, so MOVE_STOP reaches
//! the servos ahead of anything still queued. Motion requests queued at that
//! point are answered with [`ControlError::Cancelled`] and never run; other
//! queued requests are served after the stop, in their original order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use hardware::hiwonder::{
    LinkParams, LinkSession, SerialTransport, ServoRole, SimHandle, Transport, TransportResult,
};
use tracing::{debug, error, info, warn};

use crate::calibration::CalibrationCurve;
use crate::config::{check_curve_in_limits, ConfigError, Settings};
use crate::error::{ControlError, ControlResult};
use crate::motion::{Finished, MotionController, MoveReport, PerRole, PositionEstimate, ProcedureKind};

/// How long the worker sleeps when nothing is scheduled.
pub const IDLE_POLL: Duration = Duration::from_millis(100);

/// Opens a transport for the given link parameters.
pub type Connector = Box<dyn FnMut(&LinkParams) -> TransportResult<Box<dyn Transport>> + Send>;

/// Connector for a real USB-serial adapter.
pub fn serial_connector() -> Connector {
    Box::new(|params: &LinkParams| Ok(Box::new(SerialTransport::open(params)?) as Box<dyn Transport>))
}

/// Connector that opens the simulated bus behind `handle`.
pub fn simulated_connector(handle: SimHandle) -> Connector {
    Box::new(move |_: &LinkParams| Ok(Box::new(handle.bus()) as Box<dyn Transport>))
}

/// Reply channel for one request.
pub type Reply<T> = Sender<ControlResult<T>>;

/// A request to the session worker.
pub enum Request {
    Connect(Reply<()>),
    /// Open the link without configuring the servos or touching torque.
    Attach(Reply<()>),
    Disconnect(Reply<()>),
    /// Validate and apply new settings, reconnecting if connected.
    Reconfigure(Box<Settings>, Reply<()>),
    SetFocalLength {
        mm: f64,
        velocity: Option<f64>,
        reply: Reply<MoveReport>,
    },
    SetFocusOffset {
        offset: f64,
        velocity: Option<f64>,
        reply: Reply<MoveReport>,
    },
    NudgeFocuser {
        delta: i32,
        velocity: Option<f64>,
        reply: Reply<MoveReport>,
    },
    MoveRaw {
        role: ServoRole,
        raw: i32,
        velocity: Option<f64>,
        reply: Reply<MoveReport>,
    },
    /// Answered once homing completes.
    Home(ServoRole, Reply<PositionEstimate>),
    /// Cached estimate, no bus traffic.
    Status(ServoRole, Reply<PositionEstimate>),
    /// Read the position now.
    Refresh(ServoRole, Reply<PositionEstimate>),
    /// Answered once the role has no procedure in progress.
    WaitIdle(ServoRole, Reply<PositionEstimate>),
    ReplaceCalibration {
        role: ServoRole,
        curve: Option<CalibrationCurve>,
        reply: Reply<()>,
    },
    LinkStatus(Reply<LinkStatus>),
    Settings(Reply<Settings>),
    Shutdown(Reply<()>),
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Connect(_) => "connect",
            Request::Attach(_) => "attach",
            Request::Disconnect(_) => "disconnect",
            Request::Reconfigure(..) => "reconfigure",
            Request::SetFocalLength { .. } => "set focal length",
            Request::SetFocusOffset { .. } => "set focus offset",
            Request::NudgeFocuser { .. } => "nudge focuser",
            Request::MoveRaw { .. } => "move raw",
            Request::Home(..) => "home",
            Request::Status(..) => "status",
            Request::Refresh(..) => "refresh",
            Request::WaitIdle(..) => "wait idle",
            Request::ReplaceCalibration { .. } => "replace calibration",
            Request::LinkStatus(_) => "link status",
            Request::Settings(_) => "settings",
            Request::Shutdown(_) => "shutdown",
        }
    }

    /// Whether the request starts or supersedes a motion procedure.
    fn is_motion(&self) -> bool {
        matches!(
            self,
            Request::SetFocalLength { .. }
                | Request::SetFocusOffset { .. }
                | Request::NudgeFocuser { .. }
                | Request::MoveRaw { .. }
                | Request::Home(..)
        )
    }

    /// Answer the request with [`ControlError::Cancelled`] without running it.
    fn cancel(self) {
        match self {
            Request::Connect(reply)
            | Request::Attach(reply)
            | Request::Disconnect(reply)
            | Request::Reconfigure(_, reply)
            | Request::ReplaceCalibration { reply, .. }
            | Request::Shutdown(reply) => {
                let _ = reply.send(Err(ControlError::Cancelled));
            }
            Request::SetFocalLength { reply, .. }
            | Request::SetFocusOffset { reply, .. }
            | Request::NudgeFocuser { reply, .. }
            | Request::MoveRaw { reply, .. } => {
                let _ = reply.send(Err(ControlError::Cancelled));
            }
            Request::Home(_, reply)
            | Request::Status(_, reply)
            | Request::Refresh(_, reply)
            | Request::WaitIdle(_, reply) => {
                let _ = reply.send(Err(ControlError::Cancelled));
            }
            Request::LinkStatus(reply) => {
                let _ = reply.send(Err(ControlError::Cancelled));
            }
            Request::Settings(reply) => {
                let _ = reply.send(Err(ControlError::Cancelled));
            }
        }
    }
}

/// Connection state as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub connected: bool,
    pub port: String,
    /// Why the last link was lost, if it failed rather than being closed.
    pub fault: Option<String>,
}

/// Caller-side wait bounds, derived from settings.
#[derive(Debug, Clone, Copy)]
struct Waits {
    request: Duration,
    connect: Duration,
    homing: PerRole<Duration>,
}

impl Waits {
    fn from_settings(settings: &Settings) -> Self {
        let request = settings.request_timeout();
        let command = settings.command_timeout();
        Self {
            request,
            // Four reads and a torque write per servo, with retries.
            connect: request.saturating_add(command.saturating_mul(16)),
            homing: PerRole::new(
                request.saturating_add(settings.focuser.homing_bound(command)),
                request.saturating_add(settings.zoom.homing_bound(command)),
            ),
        }
    }
}

/// Handle to a running session.
///
/// Dropping the handle shuts the worker down, which releases torque and
/// closes the port.
pub struct Session {
    requests: Sender<Request>,
    estop: Sender<Reply<()>>,
    cancel: Arc<AtomicBool>,
    waits: std::sync::Mutex<Waits>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Validate `settings` and start the worker thread. Does not connect.
    pub fn start(settings: Settings, connector: Connector) -> ControlResult<Self> {
        let (mut session, worker) = Self::unstarted(settings, connector)?;
        session.worker = Some(thread::spawn(move || worker.run()));
        Ok(session)
    }

    /// Build a session whose worker is driven by the caller.
    pub fn unstarted(settings: Settings, connector: Connector) -> ControlResult<(Self, Worker)> {
        settings.validate()?;
        let (request_tx, request_rx) = unbounded();
        let (estop_tx, estop_rx) = unbounded();
        let cancel = Arc::new(AtomicBool::new(false));

        let session = Self {
            requests: request_tx,
            estop: estop_tx,
            cancel: cancel.clone(),
            waits: std::sync::Mutex::new(Waits::from_settings(&settings)),
            worker: None,
        };
        let worker = Worker {
            requests: request_rx,
            estop: estop_rx,
            cancel,
            motion: MotionController::new(&settings),
            settings,
            connector,
            link: None,
            fault: None,
            deferred: VecDeque::new(),
            homing_replies: PerRole::default(),
            idle_waiters: PerRole::default(),
            stopping: false,
        };
        Ok((session, worker))
    }

    /// Queue a request built around a fresh reply channel.
    pub fn submit<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> ControlResult<Receiver<ControlResult<T>>> {
        let (reply, answer) = crossbeam_channel::bounded(1);
        self.requests
            .send(make(reply))
            .map_err(|_| ControlError::WorkerGone)?;
        Ok(answer)
    }

    fn call<T>(&self, wait: Duration, make: impl FnOnce(Reply<T>) -> Request) -> ControlResult<T> {
        let answer = self.submit(make)?;
        wait_for(&answer, wait)
    }

    fn waits(&self) -> Waits {
        match self.waits.lock() {
            Ok(waits) => *waits,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Open the link and initialize both servos.
    pub fn connect(&self) -> ControlResult<()> {
        self.call(self.waits().connect, Request::Connect)
    }

    /// Open the link but leave the servos as they are: no mode or limit
    /// writes and no torque change. Axes report `Unhomed` until refreshed.
    /// Enough to send an emergency stop.
    pub fn attach(&self) -> ControlResult<()> {
        self.call(self.waits().request, Request::Attach)
    }

    /// Stop, release torque and close the port.
    pub fn disconnect(&self) -> ControlResult<()> {
        self.call(self.waits().request, Request::Disconnect)
    }

    /// Apply new settings. A connected session reconnects with them.
    pub fn reconfigure(&self, settings: Settings) -> ControlResult<()> {
        settings.validate()?;
        let waits = Waits::from_settings(&settings);
        self.call(waits.connect, |reply| {
            Request::Reconfigure(Box::new(settings), reply)
        })?;
        if let Ok(mut current) = self.waits.lock() {
            *current = waits;
        }
        Ok(())
    }

    /// Zoom to `mm`. Returns once the first command is on the bus.
    pub fn set_focal_length(&self, mm: f64) -> ControlResult<MoveReport> {
        self.call(self.waits().request, |reply| Request::SetFocalLength {
            mm,
            velocity: None,
            reply,
        })
    }

    pub fn set_focus_offset(&self, offset: f64) -> ControlResult<MoveReport> {
        self.call(self.waits().request, |reply| Request::SetFocusOffset {
            offset,
            velocity: None,
            reply,
        })
    }

    /// Move the focuser by `delta` raw counts.
    pub fn nudge_focuser(&self, delta: i32) -> ControlResult<MoveReport> {
        self.call(self.waits().request, |reply| Request::NudgeFocuser {
            delta,
            velocity: None,
            reply,
        })
    }

    /// Move `role` to a raw position, optionally slower than its cap.
    pub fn move_raw(
        &self,
        role: ServoRole,
        raw: i32,
        velocity: Option<f64>,
    ) -> ControlResult<MoveReport> {
        self.call(self.waits().request, |reply| Request::MoveRaw {
            role,
            raw,
            velocity,
            reply,
        })
    }

    /// Home `role` and wait for the result.
    pub fn home(&self, role: ServoRole) -> ControlResult<PositionEstimate> {
        self.call(self.waits().homing[role], |reply| Request::Home(role, reply))
    }

    /// Last known state of `role`.
    pub fn get_status(&self, role: ServoRole) -> ControlResult<PositionEstimate> {
        self.call(self.waits().request, |reply| Request::Status(role, reply))
    }

    /// Read `role`'s position from the servo and return the new estimate.
    pub fn refresh(&self, role: ServoRole) -> ControlResult<PositionEstimate> {
        self.call(self.waits().request, |reply| Request::Refresh(role, reply))
    }

    /// Wait up to `timeout` for `role` to finish its current procedure.
    pub fn wait_idle(&self, role: ServoRole, timeout: Duration) -> ControlResult<PositionEstimate> {
        self.call(timeout, |reply| Request::WaitIdle(role, reply))
    }

    pub fn replace_calibration(
        &self,
        role: ServoRole,
        curve: Option<CalibrationCurve>,
    ) -> ControlResult<()> {
        self.call(self.waits().request, |reply| Request::ReplaceCalibration {
            role,
            curve,
            reply,
        })
    }

    pub fn link_status(&self) -> ControlResult<LinkStatus> {
        self.call(self.waits().request, Request::LinkStatus)
    }

    /// Settings the worker is currently running with.
    pub fn settings(&self) -> ControlResult<Settings> {
        self.call(self.waits().request, Request::Settings)
    }

    /// Raise the stop flag and queue an emergency stop ahead of all requests.
    pub fn request_emergency_stop(&self) -> ControlResult<Receiver<ControlResult<()>>> {
        self.cancel.store(true, Ordering::SeqCst);
        let (reply, answer) = crossbeam_channel::bounded(1);
        self.estop.send(reply).map_err(|_| ControlError::WorkerGone)?;
        Ok(answer)
    }

    /// Halt both servos and discard queued motion requests.
    pub fn emergency_stop(&self) -> ControlResult<()> {
        let answer = self.request_emergency_stop()?;
        wait_for(&answer, self.waits().request)
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(mut self) -> ControlResult<()> {
        self.stop_worker()
    }

    fn stop_worker(&mut self) -> ControlResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let result = self.call(self.waits().connect, Request::Shutdown);
        if worker.join().is_err() {
            error!("Session worker panicked");
            return Err(ControlError::WorkerGone);
        }
        match result {
            Err(ControlError::WorkerGone) => Ok(()),
            other => other,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.stop_worker() {
            warn!("Session shutdown: {}", e);
        }
    }
}

fn wait_for<T>(answer: &Receiver<ControlResult<T>>, wait: Duration) -> ControlResult<T> {
    match answer.recv_timeout(wait) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(ControlError::RequestTimeout(wait)),
        Err(RecvTimeoutError::Disconnected) => Err(ControlError::WorkerGone),
    }
}

/// The worker side of a session: owns the link and serves requests.
pub struct Worker {
    requests: Receiver<Request>,
    estop: Receiver<Reply<()>>,
    cancel: Arc<AtomicBool>,
    settings: Settings,
    connector: Connector,
    link: Option<LinkSession>,
    motion: MotionController,
    fault: Option<String>,
    /// Non-motion requests held back by an emergency stop, served first.
    deferred: VecDeque<Request>,
    homing_replies: PerRole<Option<Reply<PositionEstimate>>>,
    idle_waiters: PerRole<Vec<Reply<PositionEstimate>>>,
    stopping: bool,
}

impl Worker {
    /// Serve requests until shutdown or until every handle is gone.
    pub fn run(mut self) {
        debug!("Session worker started");
        while self.run_once(IDLE_POLL) {}
        self.disconnect();
        debug!("Session worker stopped");
    }

    /// Serve at most one request, waiting up to `wait` for it, then run any
    /// procedure steps that are due. Returns false once the worker should
    /// exit.
    pub fn run_once(&mut self, wait: Duration) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            self.emergency_stop(None);
        }
        if self.stopping {
            return false;
        }

        if let Some(request) = self.deferred.pop_front() {
            if !self.handle(request) || self.stopping {
                return false;
            }
            self.step_procedures();
            self.upkeep();
            return true;
        }

        let timeout = match self.motion.next_wake() {
            Some(at) if self.link.is_some() => {
                at.saturating_duration_since(Instant::now()).min(wait)
            }
            _ => wait,
        };

        let requests = self.requests.clone();
        let estop = self.estop.clone();
        let keep_running = select! {
            recv(estop) -> msg => {
                if let Ok(reply) = msg {
                    self.emergency_stop(Some(reply));
                }
                true
            }
            recv(requests) -> msg => match msg {
                Ok(request) if self.cancel.load(Ordering::SeqCst) => {
                    self.hold_back(request);
                    self.emergency_stop(None);
                    true
                }
                Ok(request) => self.handle(request),
                Err(_) => false,
            },
            default(timeout) => true,
        };
        if !keep_running || self.stopping {
            return false;
        }

        self.step_procedures();
        self.upkeep();
        true
    }

    fn handle(&mut self, request: Request) -> bool {
        debug!("Request: {}", request.name());
        let now = Instant::now();
        match request {
            Request::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Request::Attach(reply) => {
                let _ = reply.send(self.attach());
            }
            Request::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(Ok(()));
            }
            Request::Reconfigure(settings, reply) => {
                let _ = reply.send(self.reconfigure(*settings));
            }
            Request::SetFocalLength {
                mm,
                velocity,
                reply,
            } => {
                let result = self.begin(|m, l| m.set_focal_length(l, mm, velocity, now));
                let _ = reply.send(result);
            }
            Request::SetFocusOffset {
                offset,
                velocity,
                reply,
            } => {
                let result = self.begin(|m, l| m.set_focus_offset(l, offset, velocity, now));
                let _ = reply.send(result);
            }
            Request::NudgeFocuser {
                delta,
                velocity,
                reply,
            } => {
                let result = self.begin(|m, l| m.nudge_focuser(l, delta, velocity, now));
                let _ = reply.send(result);
            }
            Request::MoveRaw {
                role,
                raw,
                velocity,
                reply,
            } => {
                let result = self.begin(|m, l| m.move_to_raw(l, role, raw, velocity, now));
                let _ = reply.send(result);
            }
            Request::Home(role, reply) => {
                match self.with_link(|m, _| m.start_homing(role, now)) {
                    Ok(()) => {
                        info!("{}: homing started", role);
                        self.homing_replies[role] = Some(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Request::Status(role, reply) => {
                let result = self.require_link().map(|_| self.motion.status(role));
                let _ = reply.send(result);
            }
            Request::Refresh(role, reply) => {
                let _ = reply.send(self.with_link(|m, l| m.refresh(l, role)));
            }
            Request::WaitIdle(role, reply) => {
                if let Err(e) = self.require_link() {
                    let _ = reply.send(Err(e));
                } else if self.motion.is_idle(role) {
                    let _ = reply.send(Ok(self.motion.status(role)));
                } else {
                    self.idle_waiters[role].push(reply);
                }
            }
            Request::ReplaceCalibration { role, curve, reply } => {
                let _ = reply.send(self.replace_calibration(role, curve));
            }
            Request::LinkStatus(reply) => {
                let _ = reply.send(Ok(self.link_status()));
            }
            Request::Settings(reply) => {
                let _ = reply.send(Ok(self.settings.clone()));
            }
            Request::Shutdown(reply) => {
                info!("Session shutting down");
                self.disconnect();
                self.stopping = true;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    // ==================== Link lifecycle ====================

    fn require_link(&self) -> ControlResult<()> {
        match self.link {
            Some(_) => Ok(()),
            None => Err(ControlError::NotConnected),
        }
    }

    /// Run `f` against the link, handling a link failure it causes.
    fn with_link<T>(
        &mut self,
        f: impl FnOnce(&mut MotionController, &mut LinkSession) -> ControlResult<T>,
    ) -> ControlResult<T> {
        let link = self.link.as_mut().ok_or(ControlError::NotConnected)?;
        let result = f(&mut self.motion, link);
        let failed = link.is_failed();
        if failed {
            self.link_failed();
        }
        result
    }

    fn begin(
        &mut self,
        f: impl FnOnce(&mut MotionController, &mut LinkSession) -> ControlResult<(MoveReport, Option<Finished>)>,
    ) -> ControlResult<MoveReport> {
        let (report, finished) = self.with_link(f)?;
        if let Some(done) = finished {
            self.dispatch(done);
        }
        Ok(report)
    }

    /// Open the transport. Records a fault if the port cannot be opened.
    fn open_link(&mut self) -> ControlResult<LinkSession> {
        let params = self.settings.link_params();
        info!("Connecting on {} at {} baud", params.port, params.baud_rate);

        let transport = (self.connector)(&params).map_err(|e| {
            let err = ControlError::from(e);
            error!("Cannot open {}: {}", params.port, err);
            self.fault = Some(err.to_string());
            err
        })?;
        let mut link = LinkSession::new(transport, params);
        if let Err(e) = link.clear_input() {
            debug!("Could not clear input on connect: {}", e);
        }
        Ok(link)
    }

    fn attach(&mut self) -> ControlResult<()> {
        if self.link.is_some() {
            debug!("Already connected");
            return Ok(());
        }
        let link = self.open_link()?;
        self.motion = MotionController::new(&self.settings);
        self.link = Some(link);
        self.fault = None;
        info!("Attached without initializing servos");
        Ok(())
    }

    fn connect(&mut self) -> ControlResult<()> {
        if self.link.is_some() {
            debug!("Already connected");
            return Ok(());
        }
        let mut link = self.open_link()?;

        let mut motion = MotionController::new(&self.settings);
        if let Err(e) = motion.initialize(&mut link) {
            error!("Connect failed: {}", e);
            link.close();
            self.fault = Some(e.to_string());
            return Err(e);
        }

        self.motion = motion;
        self.link = Some(link);
        self.fault = None;
        info!("Connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        for done in self.motion.abort_all(|| ControlError::NotConnected) {
            self.dispatch(done);
        }
        if let Some(mut link) = self.link.take() {
            if !link.is_failed() {
                if let Err(e) = self.motion.stop_all(&mut link) {
                    debug!("Stop on disconnect: {}", e);
                }
                self.motion.release(&mut link);
            }
            link.close();
            info!("Disconnected");
        }
        self.fail_waiters(|| ControlError::NotConnected);
        self.fault = None;
    }

    /// Drop a failed link and fail everything that depended on it.
    fn link_failed(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        let reason = link.failure().unwrap_or("link failed").to_string();
        error!("Link lost: {}", reason);
        link.close();

        for done in self
            .motion
            .abort_all(|| ControlError::LinkUnavailable(reason.clone()))
        {
            self.dispatch(done);
        }
        self.fail_waiters(|| ControlError::LinkUnavailable(reason.clone()));
        self.fault = Some(reason);
    }

    fn reconfigure(&mut self, settings: Settings) -> ControlResult<()> {
        settings.validate()?;
        let reconnect = self.link.is_some();
        self.disconnect();
        self.settings = settings;
        self.motion = MotionController::new(&self.settings);
        info!("Settings applied");
        if reconnect {
            self.connect()?;
        }
        Ok(())
    }

    fn replace_calibration(
        &mut self,
        role: ServoRole,
        curve: Option<CalibrationCurve>,
    ) -> ControlResult<()> {
        if let Some(curve) = &curve {
            check_curve_in_limits(curve, &self.settings.servo(role).limits)
                .map_err(|msg| ConfigError::Invalid(format!("{role}: {msg}")))?;
        }
        self.settings.servo_mut(role).calibration = curve.clone();
        self.motion.replace_calibration(role, curve.map(Arc::new));
        Ok(())
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus {
            connected: self.link.is_some(),
            port: self.settings.port.clone(),
            fault: self.fault.clone(),
        }
    }

    // ==================== Emergency stop ====================

    fn emergency_stop(&mut self, first: Option<Reply<()>>) {
        warn!("Emergency stop");
        let result = match self.link.as_mut() {
            Some(link) => {
                let result = self.motion.stop_all(link);
                if link.is_failed() {
                    self.link_failed();
                }
                result
            }
            None => {
                warn!("Emergency stop while disconnected, nothing to stop");
                Ok(())
            }
        };

        for done in self.motion.abort_all(|| ControlError::Cancelled) {
            self.dispatch(done);
        }

        let mut discarded = 0;
        while let Ok(request) = self.requests.try_recv() {
            if request.is_motion() {
                discarded += 1;
            }
            self.hold_back(request);
        }
        if discarded > 0 {
            info!("Emergency stop discarded {} queued motion requests", discarded);
        }
        self.cancel.store(false, Ordering::SeqCst);

        let error = result.err().map(|e| e.to_string());
        for reply in first.into_iter().chain(self.estop.try_iter()) {
            let answer = match &error {
                Some(reason) => Err(ControlError::LinkUnavailable(reason.clone())),
                None => Ok(()),
            };
            let _ = reply.send(answer);
        }
    }

    /// Cancel a motion request that arrived during an emergency stop, or keep
    /// any other request to serve once the stop is done.
    fn hold_back(&mut self, request: Request) {
        match request {
            Request::Shutdown(reply) => {
                self.stopping = true;
                let _ = reply.send(Ok(()));
            }
            request if request.is_motion() => request.cancel(),
            request => self.deferred.push_back(request),
        }
    }

    // ==================== Procedures ====================

    fn step_procedures(&mut self) {
        if self.cancel.load(Ordering::SeqCst) {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let finished = self.motion.poll(link, Instant::now(), &self.cancel);
        let failed = link.is_failed();
        for done in finished {
            self.dispatch(done);
        }
        if failed {
            self.link_failed();
        }
    }

    fn upkeep(&mut self) {
        if self.motion.is_busy() {
            return;
        }
        let interval = self.settings.telemetry_interval();
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(e) = self.motion.refresh_telemetry(link, interval) {
            debug!("Telemetry upkeep: {}", e);
        }
        let failed = link.is_failed();
        if failed {
            self.link_failed();
        }
    }

    /// Route a finished procedure to whoever is waiting on it.
    fn dispatch(&mut self, done: Finished) {
        let role = done.role;
        match &done.result {
            Ok(outcome) => debug!("{}: {} finished: {:?}", role, done.kind, outcome),
            Err(e) => warn!("{}: {} failed: {}", role, done.kind, e),
        }
        let status = self.motion.status(role);
        if done.kind == ProcedureKind::Homing {
            if let Some(reply) = self.homing_replies[role].take() {
                let _ = reply.send(done.result.map(|_| status.clone()));
            }
        }
        if self.motion.is_idle(role) {
            for waiter in self.idle_waiters[role].drain(..) {
                let _ = waiter.send(Ok(status.clone()));
            }
        }
    }

    fn fail_waiters(&mut self, reason: impl Fn() -> ControlError) {
        for role in [ServoRole::Focuser, ServoRole::Zoom] {
            if let Some(reply) = self.homing_replies[role].take() {
                let _ = reply.send(Err(reason()));
            }
            for waiter in self.idle_waiters[role].drain(..) {
                let _ = waiter.send(Err(reason()));
            }
        }
    }
}
