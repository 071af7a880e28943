//! End-to-end behaviour of a session driving simulated servos.

use std::time::Duration;

use hardware::hiwonder::{
    LinkParams, Opcode, ServoRole, SimHandle, SimServo, SimulatedBus, Transport, TransportError,
    TransportResult, TravelLimits,
};
use scope_control::motion::{AxisState, ProcedureOutcome};
use scope_control::session::{serial_connector, simulated_connector, Connector, Request, Worker};
use scope_control::{Anchor, CalibrationCurve, ControlError, Session, Settings};

const ZOOM: u8 = 1;
const FOCUSER: u8 = 2;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.port = "sim".into();
    settings.command_timeout_ms = 20;
    for servo in [&mut settings.focuser, &mut settings.zoom] {
        servo.limits = TravelLimits::new(50, 950, 1000);
        servo.max_velocity = 100_000.0;
        servo.homing_velocity = 100_000.0;
        servo.homing_step = 100;
        servo.homing_max_attempts = 20;
        servo.settle_time_ms = 0;
        servo.min_command_interval_ms = 0;
        servo.move_timeout_ms = 500;
        servo.position_tolerance = 5;
        servo.require_homing = false;
        servo.calibration = None;
    }
    settings.zoom.calibration = Some(
        CalibrationCurve::new(vec![Anchor::new(8.0, 100), Anchor::new(24.0, 900)]).unwrap(),
    );
    settings
}

fn servos() -> Vec<SimServo> {
    vec![
        SimServo::new(ZOOM, 300),
        SimServo::new(FOCUSER, 900).with_hard_stops(90, 1500),
    ]
}

/// Connected session whose worker the test drives by hand.
fn driven(settings: Settings, servos: Vec<SimServo>) -> (Session, Worker, SimHandle) {
    let (_bus, handle) = SimulatedBus::new(servos);
    let (session, mut worker) =
        Session::unstarted(settings, simulated_connector(handle.clone())).unwrap();
    let connect = session.submit(Request::Connect).unwrap();
    worker.run_once(Duration::ZERO);
    connect.try_recv().unwrap().unwrap();
    handle.take_sent();
    (session, worker, handle)
}

fn link_up(session: &Session, worker: &mut Worker) -> bool {
    let status = session.submit(Request::LinkStatus).unwrap();
    worker.run_once(Duration::ZERO);
    status.try_recv().unwrap().unwrap().connected
}

fn connected(settings: Settings, servos: Vec<SimServo>) -> (Session, SimHandle) {
    let (_bus, handle) = SimulatedBus::new(servos);
    let session = Session::start(settings, simulated_connector(handle.clone())).unwrap();
    session.connect().unwrap();
    handle.take_sent();
    (session, handle)
}

#[test]
fn test_focal_length_move_reaches_ready() {
    let (session, handle) = connected(settings(), servos());
    handle.script_positions(ZOOM, &[498]);

    let report = session.set_focal_length(16.0).unwrap();
    assert_eq!(report.target_raw, 500);
    assert_eq!(handle.move_targets(ZOOM), vec![500]);

    let status = session.wait_idle(ServoRole::Zoom, Duration::from_secs(2)).unwrap();
    assert_eq!(status.state, AxisState::Ready);
    assert_eq!(status.raw, Some(498));
    assert_eq!(
        status.last_outcome,
        Some(ProcedureOutcome::Reached { raw: 498 })
    );
}

#[test]
fn test_nudge_beyond_limit_sends_nothing() {
    let (session, handle) = connected(settings(), servos());

    let err = session.nudge_focuser(2000).unwrap_err();
    match err {
        ControlError::LimitReached {
            current, min, max, ..
        } => {
            assert_eq!(current, 900);
            assert_eq!((min, max), (50, 950));
        }
        other => panic!("expected LimitReached, got {other:?}"),
    }
    assert!(handle.sent().is_empty());
    assert_eq!(
        session.get_status(ServoRole::Focuser).unwrap().state,
        AxisState::Ready
    );
}

#[test]
fn test_repeated_timeouts_drop_the_link() {
    let (session, handle) = connected(settings(), servos());
    handle.set_silent(ZOOM, true);

    for _ in 0..2 {
        assert!(matches!(
            session.refresh(ServoRole::Zoom),
            Err(ControlError::Timeout {
                role: ServoRole::Zoom
            })
        ));
    }
    assert!(matches!(
        session.refresh(ServoRole::Zoom),
        Err(ControlError::LinkUnavailable(_))
    ));

    assert!(matches!(
        session.get_status(ServoRole::Focuser),
        Err(ControlError::NotConnected)
    ));
    let link = session.link_status().unwrap();
    assert!(!link.connected);
    assert!(link.fault.is_some());
    assert!(handle.is_closed());

    handle.set_silent(ZOOM, false);
    session.connect().unwrap();
    assert!(session.link_status().unwrap().connected);
}

#[test]
fn test_corrupt_reply_leaves_position_unchanged() {
    let (session, handle) = connected(settings(), servos());
    let before = session.get_status(ServoRole::Zoom).unwrap();

    handle.with_servo(ZOOM, |s| s.scripted_positions.push_back(700));
    handle.corrupt_next_replies(2);
    assert!(matches!(
        session.refresh(ServoRole::Zoom),
        Err(ControlError::ChecksumError { .. })
    ));
    assert_eq!(session.get_status(ServoRole::Zoom).unwrap().raw, before.raw);

    // One corrupt reply is absorbed by the retry.
    handle.corrupt_next_replies(1);
    assert_eq!(session.refresh(ServoRole::Zoom).unwrap().raw, Some(300));
}

#[test]
fn test_emergency_stop_preempts_queued_requests() {
    let (_bus, handle) = SimulatedBus::new(servos());
    let (session, mut worker) =
        Session::unstarted(settings(), simulated_connector(handle.clone())).unwrap();
    let connect = session.submit(Request::Connect).unwrap();
    worker.run_once(Duration::ZERO);
    connect.try_recv().unwrap().unwrap();

    let slow = session
        .submit(|reply| Request::MoveRaw {
            role: ServoRole::Focuser,
            raw: 100,
            velocity: Some(10.0),
            reply,
        })
        .unwrap();
    worker.run_once(Duration::ZERO);
    slow.try_recv().unwrap().unwrap();
    handle.take_sent();

    let queued_move = session
        .submit(|reply| Request::SetFocalLength {
            mm: 20.0,
            velocity: None,
            reply,
        })
        .unwrap();
    let queued_status = session
        .submit(|reply| Request::Status(ServoRole::Zoom, reply))
        .unwrap();
    let stop = session.request_emergency_stop().unwrap();

    worker.run_once(Duration::ZERO);

    stop.try_recv().unwrap().unwrap();
    assert!(matches!(
        queued_move.try_recv().unwrap(),
        Err(ControlError::Cancelled)
    ));
    // Status is not motion, so it is answered after the stop.
    let zoom = queued_status.try_recv().unwrap().unwrap();
    assert_eq!(zoom.role, ServoRole::Zoom);

    let sent = handle.take_sent();
    let ids: Vec<u8> = sent.iter().map(|c| c.id).collect();
    assert!(sent.iter().all(|c| c.opcode == Opcode::MoveStop));
    assert_eq!(ids, vec![FOCUSER, ZOOM]);

    let status = session.submit(|reply| Request::Status(ServoRole::Focuser, reply)).unwrap();
    worker.run_once(Duration::ZERO);
    let status = status.try_recv().unwrap().unwrap();
    assert_eq!(status.state, AxisState::Stopped);
    assert_eq!(status.target, None);
}

#[test]
fn test_homing_finds_the_end_stop() {
    let mut settings = settings();
    settings.focuser.require_homing = true;
    let (session, _handle) = connected(settings, servos());

    assert!(matches!(
        session.move_raw(ServoRole::Focuser, 500, None),
        Err(ControlError::InvalidState { .. })
    ));

    let status = session.home(ServoRole::Focuser).unwrap();
    assert_eq!(status.state, AxisState::Ready);
    assert_eq!(status.raw, Some(90));
    assert_eq!(status.offset_from_home, Some(0));

    session.move_raw(ServoRole::Focuser, 500, None).unwrap();
    let status = session
        .wait_idle(ServoRole::Focuser, Duration::from_secs(2))
        .unwrap();
    assert_eq!(status.state, AxisState::Ready);
}

#[test]
fn test_homing_gives_up_after_bounded_attempts() {
    let mut settings = settings();
    settings.focuser.require_homing = true;
    let servos = vec![
        SimServo::new(ZOOM, 300),
        SimServo::new(FOCUSER, 400)
            .with_hard_stops(90, 1500)
            .with_jitter(20),
    ];
    let (session, _handle) = connected(settings, servos);

    let err = session.home(ServoRole::Focuser).unwrap_err();
    assert!(matches!(
        err,
        ControlError::HomingFailed {
            role: ServoRole::Focuser,
            ..
        }
    ));
    assert_eq!(
        session.get_status(ServoRole::Focuser).unwrap().state,
        AxisState::Unhomed
    );
}

#[test]
fn test_reconfigure_applies_new_limits() {
    let (session, handle) = connected(settings(), servos());

    let mut narrower = settings();
    narrower.zoom.limits = TravelLimits::new(100, 600, 1000);
    narrower.zoom.calibration = None;
    session.reconfigure(narrower).unwrap();
    assert!(session.link_status().unwrap().connected);

    handle.take_sent();
    let report = session.move_raw(ServoRole::Zoom, 800, None).unwrap();
    assert_eq!(report.target_raw, 600);
    assert_eq!(session.settings().unwrap().zoom.limits.max, 600);
}

#[test]
fn test_drop_releases_torque() {
    let (session, handle) = connected(settings(), servos());
    assert!(handle.with_servo(FOCUSER, |s| s.torque_enabled));
    drop(session);
    assert!(!handle.with_servo(FOCUSER, |s| s.torque_enabled));
    assert!(!handle.with_servo(ZOOM, |s| s.torque_enabled));
    assert!(handle.is_closed());
}

#[test]
fn test_idle_telemetry_follows_interval() {
    let mut settings = settings();
    settings.telemetry_interval_ms = 3_600_000;
    let (session, mut worker, handle) = driven(settings, servos());

    for _ in 0..20 {
        worker.run_once(Duration::ZERO);
    }
    assert!(handle
        .sent()
        .iter()
        .all(|c| c.opcode != Opcode::TempRead && c.opcode != Opcode::VinRead));
    assert!(link_up(&session, &mut worker));
}

#[test]
fn test_absent_servo_does_not_drop_idle_link() {
    let mut settings = settings();
    settings.telemetry_interval_ms = 0;
    let (session, mut worker, handle) = driven(settings, vec![SimServo::new(ZOOM, 300)]);

    for _ in 0..50 {
        worker.run_once(Duration::ZERO);
    }
    assert!(link_up(&session, &mut worker));
    assert!(!handle.is_closed());
    let focuser_reads = handle
        .sent()
        .iter()
        .filter(|c| c.id == FOCUSER && c.opcode == Opcode::TempRead)
        .count();
    assert!(focuser_reads > 0);

    let status = session.submit(|reply| Request::Status(ServoRole::Focuser, reply)).unwrap();
    worker.run_once(Duration::ZERO);
    let status = status.try_recv().unwrap().unwrap();
    assert_eq!(status.state, AxisState::Unhomed);
    assert_eq!(status.raw, None);
}

#[test]
fn test_absent_servo_is_not_polled_every_loop() {
    let mut settings = settings();
    settings.telemetry_interval_ms = 3_600_000;
    let (session, mut worker, handle) = driven(settings, vec![SimServo::new(ZOOM, 300)]);

    // The focuser was polled once right after connect; the interval keeps
    // it quiet since.
    for _ in 0..20 {
        worker.run_once(Duration::ZERO);
    }
    let focuser_reads = handle
        .sent()
        .iter()
        .filter(|c| c.id == FOCUSER && c.opcode == Opcode::TempRead)
        .count();
    assert_eq!(focuser_reads, 0);
    assert!(link_up(&session, &mut worker));

    let zoom = session.submit(|reply| Request::Refresh(ServoRole::Zoom, reply)).unwrap();
    worker.run_once(Duration::ZERO);
    assert_eq!(zoom.try_recv().unwrap().unwrap().raw, Some(300));
}

#[test]
fn test_connector_failure_is_link_unavailable() {
    let connector: Connector = Box::new(
        |_: &LinkParams| -> TransportResult<Box<dyn Transport>> {
            Err(TransportError::LinkUnavailable("adapter unplugged".into()))
        },
    );
    let session = Session::start(settings(), connector).unwrap();

    let err = session.connect().unwrap_err();
    assert!(matches!(err, ControlError::LinkUnavailable(ref reason) if reason.contains("unplugged")));
    let link = session.link_status().unwrap();
    assert!(!link.connected);
    assert!(link.fault.unwrap().contains("unplugged"));
    assert!(matches!(
        session.get_status(ServoRole::Zoom),
        Err(ControlError::NotConnected)
    ));
}

#[test]
fn test_missing_serial_port_is_link_unavailable() {
    let mut settings = settings();
    settings.port = "/dev/scope-control-no-such-port".into();
    let session = Session::start(settings, serial_connector()).unwrap();

    assert!(matches!(
        session.connect(),
        Err(ControlError::LinkUnavailable(_))
    ));
    let link = session.link_status().unwrap();
    assert!(!link.connected);
    assert!(link.fault.is_some());
}

#[test]
fn test_stop_after_attach_does_not_enable_torque() {
    let (_bus, handle) = SimulatedBus::new(servos());
    let session = Session::start(settings(), simulated_connector(handle.clone())).unwrap();
    session.attach().unwrap();
    session.emergency_stop().unwrap();

    let sent = handle.sent();
    assert!(sent.iter().all(|c| c.opcode != Opcode::LoadOrUnloadWrite));
    let stops: Vec<u8> = sent
        .iter()
        .filter(|c| c.opcode == Opcode::MoveStop)
        .map(|c| c.id)
        .collect();
    assert_eq!(stops, vec![FOCUSER, ZOOM]);
    assert!(!handle.with_servo(FOCUSER, |s| s.torque_enabled));
}
