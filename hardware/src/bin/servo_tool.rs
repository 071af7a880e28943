//! Bench and provisioning CLI for Hiwonder HX-35 bus servos.
//!
//! Subcommands:
//! - `scan`: Probe a range of IDs and list the servos that answer
//! - `query`: Read position, telemetry, mode, torque and stored limits
//! - `move`: Move to an absolute raw position or by a relative amount
//! - `stop`: Halt motion
//! - `torque`: Enable or release holding torque
//! - `set-id`: Rewrite a servo's bus address (one servo on the bus only)
//! - `mode`: Switch between position (servo) and continuous rotation (motor)
//! - `limits`: Read or write the angle, temperature and voltage limits
//! - `repl`: Interactive command prompt

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hardware::hiwonder::{
    counts_to_degrees, scan, LinkParams, LinkSession, MotorMode, ServoIdentity, ServoProxy,
    ServoRole, SimServo, SimulatedBus, TravelLimits, DEFAULT_BAUD, MAX_SERVO_ID, POSITION_MAX,
    POSITION_MIN_SAFE,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::info;

/// Default USB-serial adapter.
const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// HX-35 bus servo tool
#[derive(Parser, Debug)]
#[command(name = "servo_tool")]
#[command(about = "Bench and provisioning tool for HX-35 bus servos")]
#[command(version)]
struct Args {
    /// Serial port of the bus adapter
    #[arg(long, global = true, default_value = DEFAULT_PORT)]
    port: String,

    /// Bus baud rate
    #[arg(long, global = true, default_value_t = DEFAULT_BAUD)]
    baud: u32,

    /// Reply timeout in milliseconds
    #[arg(long, global = true, default_value = "200")]
    timeout_ms: u64,

    /// Talk to a simulated bus with servos 1 and 2 instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List servo IDs that answer on the bus
    Scan {
        /// First ID to probe
        #[arg(long, default_value = "0")]
        from: u8,

        /// Last ID to probe
        #[arg(long, default_value_t = MAX_SERVO_ID)]
        to: u8,
    },

    /// Query position and telemetry
    Query {
        /// Servo ID
        #[arg(short, long)]
        id: u8,
    },

    /// Move to a raw position
    Move {
        /// Servo ID
        #[arg(short, long)]
        id: u8,

        /// Absolute raw position
        #[arg(short, long, conflicts_with = "relative")]
        position: Option<i32>,

        /// Relative move in raw counts
        #[arg(short, long, allow_hyphen_values = true)]
        relative: Option<i32>,

        /// Velocity in counts per second (full speed if omitted)
        #[arg(short, long)]
        velocity: Option<f64>,

        /// Wait this many milliseconds and report where the servo ended up
        #[arg(long, default_value = "0")]
        settle_ms: u64,
    },

    /// Stop motion
    Stop {
        /// Servo ID
        #[arg(short, long)]
        id: u8,
    },

    /// Enable or release holding torque
    Torque {
        /// Servo ID
        #[arg(short, long)]
        id: u8,

        /// "on" or "off"
        state: String,
    },

    /// Change a servo's bus address. Only one servo may be connected.
    SetId {
        /// Current ID
        #[arg(long)]
        from: u8,

        /// New ID
        #[arg(long)]
        to: u8,
    },

    /// Select position (servo) mode, or continuous rotation at a speed
    Mode {
        /// Servo ID
        #[arg(short, long)]
        id: u8,

        /// Motor-mode speed (-1000..=1000); servo mode if omitted
        #[arg(long, allow_hyphen_values = true)]
        motor: Option<i16>,
    },

    /// Read or write the limits stored in the servo
    Limits {
        /// Servo ID
        #[arg(short, long)]
        id: u8,

        /// New lower angle limit (raw)
        #[arg(long, requires = "max")]
        min: Option<u16>,

        /// New upper angle limit (raw)
        #[arg(long, requires = "min")]
        max: Option<u16>,

        /// Over-temperature cutoff in °C
        #[arg(long)]
        temp_max: Option<u8>,

        /// Minimum supply voltage in mV
        #[arg(long, requires = "vin_max")]
        vin_min: Option<u16>,

        /// Maximum supply voltage in mV
        #[arg(long, requires = "vin_min")]
        vin_max: Option<u16>,
    },

    /// Interactive command prompt
    Repl,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut link = open_link(&args)?;

    let result = match args.command {
        Command::Scan { from, to } => cmd_scan(&mut link, from, to),
        Command::Query { id } => cmd_query(&mut link, id),
        Command::Move {
            id,
            position,
            relative,
            velocity,
            settle_ms,
        } => cmd_move(&mut link, id, position, relative, velocity, settle_ms),
        Command::Stop { id } => proxy(id).stop(&mut link).map_err(Into::into),
        Command::Torque { id, state } => cmd_torque(&mut link, id, &state),
        Command::SetId { from, to } => cmd_set_id(&mut link, from, to),
        Command::Mode { id, motor } => cmd_mode(&mut link, id, motor),
        Command::Limits {
            id,
            min,
            max,
            temp_max,
            vin_min,
            vin_max,
        } => cmd_limits(
            &mut link,
            id,
            LimitChanges {
                angle: min.zip(max),
                temp_max,
                vin: vin_min.zip(vin_max),
            },
        ),
        Command::Repl => cmd_repl(&mut link),
    };

    link.close();
    result
}

fn open_link(args: &Args) -> Result<LinkSession> {
    let params = LinkParams::new(&args.port)
        .with_baud_rate(args.baud)
        .with_timeout(Duration::from_millis(args.timeout_ms));

    if args.simulate {
        info!("Using simulated bus with servos 1 and 2");
        let (bus, _handle) = SimulatedBus::new([SimServo::new(1, 500), SimServo::new(2, 500)]);
        return Ok(LinkSession::new(Box::new(bus), params));
    }

    info!("Opening {} at {} baud...", args.port, args.baud);
    LinkSession::open_serial(params).with_context(|| format!("opening {}", args.port))
}

/// Proxy with the full commandable range, for bench use.
fn proxy(id: u8) -> ServoProxy {
    ServoProxy::new(
        ServoIdentity {
            id,
            role: ServoRole::Focuser,
        },
        TravelLimits::new(POSITION_MIN_SAFE, POSITION_MAX, POSITION_MAX),
    )
}

// ==================== Scan Command ====================

fn cmd_scan(link: &mut LinkSession, from: u8, to: u8) -> Result<()> {
    if from > to || to > MAX_SERVO_ID {
        bail!("invalid ID range {from}..={to}");
    }
    info!("Scanning IDs {}..={}...", from, to);
    let found = scan(link, from..=to)?;
    if found.is_empty() {
        println!("No servos found");
    }
    for id in found {
        println!("Found servo {id}");
    }
    Ok(())
}

// ==================== Query Command ====================

fn cmd_query(link: &mut LinkSession, id: u8) -> Result<()> {
    let mut servo = proxy(id);
    let position = servo.read_state(link)?;
    servo.read_telemetry(link)?;
    let torque = servo.read_torque(link)?;
    let (min, max) = servo.read_angle_limits(link)?;
    let alarms = servo.read_alarm_triggers(link)?;
    let mode = servo.read_motor_mode(link)?;
    let temp_max = servo.read_temperature_limit(link)?;
    let (vin_min, vin_max) = servo.read_voltage_limits(link)?;
    let (target, time_ms) = servo.read_move_target(link)?;
    let state = servo.state();

    println!(
        "Servo {}: position={} ({:.1}°), temp={}°C, vin={} mV, torque={}",
        id,
        position,
        counts_to_degrees(position),
        state.temperature_c.unwrap_or_default(),
        state.voltage_mv.unwrap_or_default(),
        if torque { "on" } else { "off" },
    );
    println!("  mode={}, last move={target} over {time_ms} ms", describe_mode(mode));
    println!(
        "  angle limits=[{min}, {max}], temp max={temp_max}°C, vin=[{vin_min}, {vin_max}] mV"
    );
    println!("  alarms={alarms:?}");
    Ok(())
}

fn describe_mode(mode: MotorMode) -> String {
    match mode {
        MotorMode::Servo => "servo".to_string(),
        MotorMode::Motor { speed } => format!("motor ({speed:+})"),
    }
}

// ==================== Mode Command ====================

fn cmd_mode(link: &mut LinkSession, id: u8, motor: Option<i16>) -> Result<()> {
    let mut servo = proxy(id);
    match motor {
        Some(speed) => servo.set_motor_mode(link, speed)?,
        None => servo.set_servo_mode(link)?,
    }
    let mode = servo.read_motor_mode(link)?;
    println!("Servo {id} mode: {}", describe_mode(mode));
    Ok(())
}

// ==================== Move Command ====================

fn cmd_move(
    link: &mut LinkSession,
    id: u8,
    position: Option<i32>,
    relative: Option<i32>,
    velocity: Option<f64>,
    settle_ms: u64,
) -> Result<()> {
    let mut servo = proxy(id);
    let current = servo.read_state(link)?;

    let target = match (position, relative) {
        (Some(p), None) => p,
        (None, Some(r)) => current + r,
        _ => bail!("give exactly one of --position or --relative"),
    };

    servo.set_torque(link, true)?;
    let outcome = servo.move_to(link, target, velocity)?;
    if let Some(clamp) = outcome.clamp {
        println!(
            "Target {} clamped to {}",
            clamp.requested, clamp.used
        );
    }
    info!(
        "Servo {}: {} -> {} over {} ms",
        id, current, outcome.target, outcome.time_ms
    );

    if settle_ms > 0 {
        thread::sleep(Duration::from_millis(settle_ms));
        let arrived = servo.read_state(link)?;
        println!("Servo {id} at {arrived} (target {})", outcome.target);
    }
    Ok(())
}

// ==================== Torque Command ====================

fn parse_on_off(state: &str) -> Result<bool> {
    match state.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        other => bail!("expected on/off, got '{other}'"),
    }
}

fn cmd_torque(link: &mut LinkSession, id: u8, state: &str) -> Result<()> {
    let enabled = parse_on_off(state)?;
    let mut servo = proxy(id);
    servo.set_torque(link, enabled)?;
    let now = servo.read_torque(link)?;
    println!("Servo {id} torque {}", if now { "on" } else { "off" });
    Ok(())
}

// ==================== Provisioning ====================

fn cmd_set_id(link: &mut LinkSession, from: u8, to: u8) -> Result<()> {
    let present = scan(link, 0..=MAX_SERVO_ID)?;
    if present.len() != 1 || present[0] != from {
        bail!("set-id needs exactly servo {from} on the bus, found {present:?}");
    }

    let mut servo = proxy(from);
    servo.set_id(link, to)?;
    let confirmed = servo.ping(link)?;
    println!("Servo {from} is now {confirmed}");
    Ok(())
}

#[derive(Debug, Default)]
struct LimitChanges {
    angle: Option<(u16, u16)>,
    temp_max: Option<u8>,
    vin: Option<(u16, u16)>,
}

fn cmd_limits(link: &mut LinkSession, id: u8, changes: LimitChanges) -> Result<()> {
    let mut servo = proxy(id);
    if let Some((min, max)) = changes.angle {
        servo.write_angle_limits(link, min, max)?;
    }
    if let Some(celsius) = changes.temp_max {
        servo.set_temperature_limit(link, celsius)?;
    }
    if let Some((min_mv, max_mv)) = changes.vin {
        servo.set_voltage_limits(link, min_mv, max_mv)?;
    }
    let (min, max) = servo.read_angle_limits(link)?;
    let temp_max = servo.read_temperature_limit(link)?;
    let (vin_min, vin_max) = servo.read_voltage_limits(link)?;
    println!("Servo {id} angle limits: [{min}, {max}]");
    println!("Servo {id} temp max: {temp_max}°C, vin: [{vin_min}, {vin_max}] mV");
    Ok(())
}

// ==================== REPL ====================

fn cmd_repl(link: &mut LinkSession) -> Result<()> {
    println!("Servo REPL - 'help' for commands, 'quit' to exit");
    let mut editor = DefaultEditor::new()?;

    loop {
        let line = match editor.readline("servo> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        editor.add_history_entry(line)?;

        let words: Vec<&str> = line.split_whitespace().collect();
        let result = match words.as_slice() {
            ["quit"] | ["exit"] => break,
            ["help"] => {
                println!("  scan | query <id> | move <id> <pos> [vel] | nudge <id> <delta>");
                println!("  stop <id> | torque <id> on|off | limits <id> [min max]");
                println!("  mode <id> servo|<motor speed> | temp-max <id> <celsius>");
                Ok(())
            }
            ["scan"] => cmd_scan(link, 0, MAX_SERVO_ID),
            ["query", id] => parse_id(id).and_then(|id| cmd_query(link, id)),
            ["move", id, pos] => parse_id(id)
                .and_then(|id| cmd_move(link, id, Some(pos.parse()?), None, None, 0)),
            ["move", id, pos, vel] => parse_id(id).and_then(|id| {
                cmd_move(link, id, Some(pos.parse()?), None, Some(vel.parse()?), 0)
            }),
            ["nudge", id, delta] => parse_id(id)
                .and_then(|id| cmd_move(link, id, None, Some(delta.parse()?), None, 0)),
            ["stop", id] => parse_id(id).and_then(|id| Ok(proxy(id).stop(link)?)),
            ["torque", id, state] => parse_id(id).and_then(|id| cmd_torque(link, id, state)),
            ["limits", id] => {
                parse_id(id).and_then(|id| cmd_limits(link, id, LimitChanges::default()))
            }
            ["limits", id, min, max] => parse_id(id).and_then(|id| {
                let changes = LimitChanges {
                    angle: Some((min.parse()?, max.parse()?)),
                    ..Default::default()
                };
                cmd_limits(link, id, changes)
            }),
            ["temp-max", id, celsius] => parse_id(id).and_then(|id| {
                let changes = LimitChanges {
                    temp_max: Some(celsius.parse()?),
                    ..Default::default()
                };
                cmd_limits(link, id, changes)
            }),
            ["mode", id, "servo"] => parse_id(id).and_then(|id| cmd_mode(link, id, None)),
            ["mode", id, speed] => {
                parse_id(id).and_then(|id| cmd_mode(link, id, Some(speed.parse()?)))
            }
            _ => Err(anyhow::anyhow!("unrecognized command, try 'help'")),
        };

        if let Err(e) = result {
            println!("Error: {e:#}");
        }
        if link.is_failed() {
            bail!("bus link failed, restart the tool to reconnect");
        }
    }

    Ok(())
}

fn parse_id(s: &str) -> Result<u8> {
    let id: u8 = s.parse().with_context(|| format!("bad servo id '{s}'"))?;
    if id > MAX_SERVO_ID {
        bail!("servo id {id} exceeds {MAX_SERVO_ID}");
    }
    Ok(id)
}
