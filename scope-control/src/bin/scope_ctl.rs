//! Operator CLI for the telescope focuser and zoom eyepiece.
//!
//! Subcommands:
//! - `status`: Connect and print both axes
//! - `zoom`: Set the zoom eyepiece focal length in millimetres
//! - `focus`: Move the focuser to a calibrated focus offset
//! - `nudge`: Move the focuser by a raw amount
//! - `move`: Move either axis to a raw position
//! - `home`: Home an axis against its end stop
//! - `stop`: Emergency stop both servos
//! - `calibrate`: Store a calibration curve for an axis
//! - `config`: Create or show the settings file
//! - `repl`: Interactive session

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hardware::hiwonder::{ServoRole, SimServo, SimulatedBus};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use scope_control::config::check_curve_in_limits;
use scope_control::motion::Adjustment;
use scope_control::{
    serial_connector, simulated_connector, Anchor, CalibrationCurve, MoveReport,
    PositionEstimate, Session, Settings, SettingsStore,
};
use tracing::{info, warn};

/// How long one-shot commands wait for a move to finish.
const MOVE_WAIT: Duration = Duration::from_secs(30);

/// Telescope focuser and zoom eyepiece control
#[derive(Parser, Debug)]
#[command(name = "scope_ctl")]
#[command(about = "Control the telescope focuser and zoom eyepiece")]
#[command(version)]
struct Args {
    /// Settings directory (defaults to ~/.scope_control)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the serial port from settings
    #[arg(long, global = true)]
    port: Option<String>,

    /// Run against simulated servos instead of the serial bus
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print position and telemetry for both axes
    Status,

    /// Set the zoom focal length
    Zoom {
        /// Focal length in millimetres
        mm: f64,
    },

    /// Move the focuser to a calibrated focus offset
    Focus {
        offset: f64,
    },

    /// Move the focuser by a raw amount
    Nudge {
        /// Raw counts, negative toward the low end
        #[arg(allow_hyphen_values = true)]
        delta: i32,
    },

    /// Move an axis to a raw position
    Move {
        /// focuser or zoom
        role: ServoRole,

        raw: i32,

        /// Velocity in raw counts per second (capped by settings)
        #[arg(long)]
        velocity: Option<f64>,
    },

    /// Home an axis against its end stop
    Home {
        /// focuser or zoom
        role: ServoRole,
    },

    /// Emergency stop both servos
    Stop,

    /// Store a calibration curve, given as logical:raw anchors
    Calibrate {
        /// focuser or zoom
        role: ServoRole,

        /// Anchors such as 8:2 16:560 24:1125
        #[arg(required = true, num_args = 2..)]
        anchors: Vec<String>,
    },

    /// Manage the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Interactive command prompt
    Repl,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the settings in effect
    Show,

    /// Print the settings file location
    Path,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let store = match &args.config {
        Some(path) => SettingsStore::with_path(path.clone()),
        None => SettingsStore::new().context("cannot locate settings directory")?,
    };

    match &args.command {
        Command::Config { action } => return cmd_config(&store, action),
        Command::Calibrate { role, anchors } => return cmd_calibrate(&store, *role, anchors),
        _ => {}
    }

    let mut settings = store.load_or_default()?;
    if let Some(port) = &args.port {
        settings.port = port.clone();
    }
    // Stopping must not enable torque first, so it skips servo setup.
    let initialize = !matches!(args.command, Command::Stop);
    let session = open_session(settings, args.simulate, initialize)?;

    match args.command {
        Command::Status => cmd_status(&session),
        Command::Zoom { mm } => {
            let report = session.set_focal_length(mm)?;
            finish_move(&session, &report)
        }
        Command::Focus { offset } => {
            let report = session.set_focus_offset(offset)?;
            finish_move(&session, &report)
        }
        Command::Nudge { delta } => {
            let report = session.nudge_focuser(delta)?;
            finish_move(&session, &report)
        }
        Command::Move {
            role,
            raw,
            velocity,
        } => {
            let report = session.move_raw(role, raw, velocity)?;
            finish_move(&session, &report)
        }
        Command::Home { role } => {
            let status = session.home(role)?;
            print_status(&status);
            Ok(())
        }
        Command::Stop => {
            session.emergency_stop()?;
            println!("Both servos stopped");
            Ok(())
        }
        Command::Repl => cmd_repl(&session),
        Command::Config { .. } | Command::Calibrate { .. } => Ok(()),
    }
}

fn open_session(settings: Settings, simulate: bool, initialize: bool) -> Result<Session> {
    let connector = if simulate {
        info!("Using simulated servos");
        let focuser = &settings.focuser;
        let zoom = &settings.zoom;
        let (_bus, handle) = SimulatedBus::new([
            SimServo::new(focuser.id, (focuser.limits.min + focuser.limits.max) / 2)
                .with_hard_stops(focuser.limits.min + 40, focuser.limits.max)
                .with_speed(focuser.max_velocity),
            SimServo::new(zoom.id, zoom.limits.min).with_speed(zoom.max_velocity),
        ]);
        simulated_connector(handle)
    } else {
        serial_connector()
    };

    let session = Session::start(settings, connector)?;
    if initialize {
        session.connect()?;
    } else {
        session.attach()?;
    }
    Ok(session)
}

// ==== Status Command ====

fn cmd_status(session: &Session) -> Result<()> {
    let link = session.link_status()?;
    println!("Link: {} ({})", if link.connected { "up" } else { "down" }, link.port);
    if let Some(fault) = link.fault {
        println!("  last fault: {fault}");
    }
    for role in [ServoRole::Zoom, ServoRole::Focuser] {
        print_status(&session.refresh(role)?);
    }
    Ok(())
}

fn print_status(status: &PositionEstimate) {
    let raw = status
        .raw
        .map_or_else(|| "?".to_string(), |raw| raw.to_string());
    print!("{:>8} (id {}): {} at {}", status.role, status.id, status.state, raw);
    if let Some(logical) = status.logical {
        print!(" = {logical:.2}");
    }
    if let Some(offset) = status.offset_from_home {
        print!(", {offset:+} from home");
    }
    println!(" [{}]", status.health);
    if let (Some(t), Some(v)) = (status.temperature_c, status.voltage_mv) {
        println!("           {} °C, {:.2} V", t, v as f64 / 1000.0);
    }
    if let Some(outcome) = &status.last_outcome {
        println!("           last: {outcome:?}");
    }
}

// ==== Move Commands ====

fn print_report(report: &MoveReport) {
    println!(
        "{}: moving to {} in {} step(s) at {:.0} counts/s",
        report.role, report.target_raw, report.waypoints, report.velocity
    );
    match report.adjustment {
        Some(Adjustment::Clamped { requested, used }) => {
            println!("  requested {requested} is outside the travel limits, using {used}")
        }
        Some(Adjustment::Boundary { requested, used }) => {
            println!("  requested {requested} is beyond calibration, using {used}")
        }
        None => {}
    }
}

fn finish_move(session: &Session, report: &MoveReport) -> Result<()> {
    print_report(report);
    let status = session.wait_idle(report.role, MOVE_WAIT)?;
    print_status(&status);
    Ok(())
}

// ==== Calibrate Command ====

fn parse_anchor(s: &str) -> Result<Anchor> {
    let (logical, raw) = s
        .split_once(':')
        .with_context(|| format!("anchor '{s}' is not logical:raw"))?;
    Ok(Anchor::new(
        logical.trim().parse().with_context(|| format!("bad logical value in '{s}'"))?,
        raw.trim().parse().with_context(|| format!("bad raw value in '{s}'"))?,
    ))
}

fn cmd_calibrate(store: &SettingsStore, role: ServoRole, anchors: &[String]) -> Result<()> {
    let anchors = anchors
        .iter()
        .map(|s| parse_anchor(s))
        .collect::<Result<Vec<_>>>()?;
    let curve = CalibrationCurve::new(anchors)?;

    let mut settings = store.load_or_default()?;
    if let Err(msg) = check_curve_in_limits(&curve, &settings.servo(role).limits) {
        bail!("{role}: {msg}");
    }
    let (low, high) = curve.logical_range();
    settings.servo_mut(role).calibration = Some(curve);
    let path = store.save(&settings)?;
    println!("{role}: calibrated {low}..{high}, saved to {}", path.display());
    Ok(())
}

// ==== Config Command ====

fn cmd_config(store: &SettingsStore, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if store.settings_path().exists() && !force {
                bail!(
                    "{} already exists, use --force to overwrite",
                    store.settings_path().display()
                );
            }
            let path = store.save(&Settings::default())?;
            println!("Wrote default settings to {}", path.display());
        }
        ConfigAction::Show => {
            let settings = store.load_or_default()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigAction::Path => println!("{}", store.settings_path().display()),
    }
    Ok(())
}

// ==== REPL ====

fn parse_role(s: &str) -> Result<ServoRole> {
    s.parse()
        .map_err(|_| anyhow::anyhow!("unknown role '{s}', expected focuser or zoom"))
}

fn cmd_repl(session: &Session) -> Result<()> {
    println!("Scope REPL - 'help' for commands, 'quit' to exit");
    let mut editor = DefaultEditor::new()?;

    loop {
        let line = match editor.readline("scope> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                warn!("Interrupted, stopping servos");
                session.emergency_stop()?;
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        editor.add_history_entry(line)?;

        let words: Vec<&str> = line.split_whitespace().collect();
        if matches!(words.as_slice(), ["quit"] | ["exit"]) {
            break;
        }
        let result = run_line(session, &words);

        if let Err(e) = result {
            println!("Error: {e:#}");
        }
    }

    Ok(())
}

fn run_line(session: &Session, words: &[&str]) -> Result<()> {
    match words {
        ["help"] => {
            println!("  status | refresh <role> | link | zoom <mm> | focus <offset>");
            println!("  nudge <delta> | move <role> <raw> [vel] | home <role> | wait <role>");
            println!("  stop | connect | disconnect");
        }
        ["status"] => {
            for role in [ServoRole::Zoom, ServoRole::Focuser] {
                print_status(&session.get_status(role)?);
            }
        }
        ["refresh", role] => print_status(&session.refresh(parse_role(role)?)?),
        ["link"] => println!("{:?}", session.link_status()?),
        ["zoom", mm] => print_report(&session.set_focal_length(mm.parse()?)?),
        ["focus", offset] => print_report(&session.set_focus_offset(offset.parse()?)?),
        ["nudge", delta] => print_report(&session.nudge_focuser(delta.parse()?)?),
        ["move", role, raw] => {
            print_report(&session.move_raw(parse_role(role)?, raw.parse()?, None)?)
        }
        ["move", role, raw, vel] => print_report(&session.move_raw(
            parse_role(role)?,
            raw.parse()?,
            Some(vel.parse()?),
        )?),
        ["home", role] => print_status(&session.home(parse_role(role)?)?),
        ["wait", role] => print_status(&session.wait_idle(parse_role(role)?, MOVE_WAIT)?),
        ["stop"] => session.emergency_stop()?,
        ["connect"] => session.connect()?,
        ["disconnect"] => session.disconnect()?,
        _ => bail!("unrecognized command, try 'help'"),
    }
    Ok(())
}
