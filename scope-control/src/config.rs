//! Controller settings and their on-disk storage.
//!
//! Settings are stored as pretty-printed JSON under `~/.scope_control/` by
//! default. Every field has a default, so a partial file only overrides what
//! it names; a partial servo block is filled from that role's defaults.
//! Settings are checked with [`Settings::validate`] before a
//! session will use them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hardware::hiwonder::{
    degrees_to_counts, LinkParams, ServoRole, TravelLimits, MAX_SERVO_ID, POSITION_MAX,
    POSITION_MIN_SAFE, TEMP_LIMIT_RANGE,
};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::calibration::{Anchor, CalibrationCurve};

/// Settings file name inside the storage root.
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    /// Settings file could not be read or written.
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file is not valid JSON for [`Settings`].
    #[error("settings parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Settings parsed but are not usable.
    #[error("invalid settings: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Accepted velocity range, raw counts per second.
const VELOCITY_RANGE: (f64, f64) = (1.0, 1_000_000.0);

/// Longest accepted timeout or delay.
const MAX_DURATION_MS: u64 = 3_600_000;

const MAX_HOMING_ATTEMPTS: u32 = 10_000;

/// End of travel that homing drives toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HomeDirection {
    Min,
    Max,
}

impl HomeDirection {
    /// Sign of a homing step.
    pub fn sign(self) -> i32 {
        match self {
            HomeDirection::Min => -1,
            HomeDirection::Max => 1,
        }
    }
}

/// Per-servo settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoSettings {
    /// Bus address.
    pub id: u8,
    pub enabled: bool,
    pub limits: TravelLimits,
    /// Velocity cap for ordinary moves, raw counts per second.
    pub max_velocity: f64,
    /// Velocity used while homing, raw counts per second.
    pub homing_velocity: f64,
    /// Raw counts per homing step.
    pub homing_step: i32,
    pub homing_max_attempts: u32,
    pub home_direction: HomeDirection,
    /// Whether moves are refused until the axis has been homed.
    pub require_homing: bool,
    /// A read within this many counts of the target confirms arrival.
    pub position_tolerance: i32,
    pub settle_time_ms: u64,
    pub move_timeout_ms: u64,
    pub min_command_interval_ms: u64,
    /// Over-temperature cutoff written to the servo on connect, °C.
    pub temperature_limit_c: u8,
    /// Drop holding torque once a move or homing finishes, so the axis can
    /// be turned by hand between commands.
    pub release_after_move: bool,
    /// Logical to raw mapping (focal length for zoom, focus offset for the
    /// focuser).
    #[serde(default)]
    pub calibration: Option<CalibrationCurve>,
}

impl ServoSettings {
    /// Zoom ring: 8-24 mm over 0-270°, full sweep in 5 s.
    pub fn zoom_default() -> Self {
        let max_raw = degrees_to_counts(270.0);
        Self {
            id: 1,
            enabled: true,
            limits: TravelLimits::new(POSITION_MIN_SAFE, max_raw, 400),
            max_velocity: (max_raw - POSITION_MIN_SAFE) as f64 / 5.0,
            homing_velocity: 100.0,
            homing_step: 40,
            homing_max_attempts: 40,
            home_direction: HomeDirection::Min,
            require_homing: false,
            position_tolerance: 5,
            settle_time_ms: 100,
            move_timeout_ms: 8000,
            min_command_interval_ms: 50,
            temperature_limit_c: 100,
            release_after_move: true,
            calibration: CalibrationCurve::new(vec![
                Anchor::new(8.0, POSITION_MIN_SAFE),
                Anchor::new(24.0, max_raw),
            ])
            .ok(),
        }
    }

    /// Focuser knob: full turn of travel, homed against the low stop.
    pub fn focuser_default() -> Self {
        Self {
            id: 2,
            enabled: true,
            limits: TravelLimits::new(POSITION_MIN_SAFE, POSITION_MAX, 150),
            max_velocity: 300.0,
            homing_velocity: 60.0,
            homing_step: 25,
            homing_max_attempts: 80,
            home_direction: HomeDirection::Min,
            require_homing: true,
            position_tolerance: 2,
            settle_time_ms: 100,
            move_timeout_ms: 5000,
            min_command_interval_ms: 50,
            temperature_limit_c: 100,
            release_after_move: false,
            calibration: None,
        }
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_time_ms)
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }

    pub fn min_command_interval(&self) -> Duration {
        Duration::from_millis(self.min_command_interval_ms)
    }

    /// Upper bound on how long homing can take with these settings.
    /// Saturates at [`Duration::MAX`] rather than overflowing.
    pub fn homing_bound(&self, command_timeout: Duration) -> Duration {
        let step_time =
            Duration::try_from_secs_f64(self.homing_step.max(0) as f64 / self.homing_velocity)
                .unwrap_or(Duration::MAX);
        let per_attempt = step_time
            .saturating_add(self.settle_time())
            .saturating_add(self.min_command_interval())
            .saturating_add(command_timeout.saturating_mul(4));
        per_attempt.saturating_mul(self.homing_max_attempts.saturating_add(1))
    }

    fn validate(&self, role: ServoRole) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(format!("{role}: {msg}")));
        let l = &self.limits;

        if self.id > MAX_SERVO_ID {
            return invalid(format!("id {} exceeds {MAX_SERVO_ID}", self.id));
        }
        if l.min >= l.max {
            return invalid(format!("limits [{}, {}] are empty", l.min, l.max));
        }
        if l.min < POSITION_MIN_SAFE {
            return invalid(format!(
                "min {} is below the safe minimum {POSITION_MIN_SAFE}",
                l.min
            ));
        }
        if l.max > POSITION_MAX {
            return invalid(format!("max {} exceeds {POSITION_MAX}", l.max));
        }
        if l.max_step <= 0 {
            return invalid("max_step must be positive".into());
        }
        let (v_min, v_max) = VELOCITY_RANGE;
        for (name, v) in [
            ("max_velocity", self.max_velocity),
            ("homing_velocity", self.homing_velocity),
        ] {
            if !(v_min..=v_max).contains(&v) {
                return invalid(format!("{name} must be within {v_min}..={v_max}, got {v}"));
            }
        }
        for (name, ms) in [
            ("settle_time_ms", self.settle_time_ms),
            ("move_timeout_ms", self.move_timeout_ms),
            ("min_command_interval_ms", self.min_command_interval_ms),
        ] {
            if ms > MAX_DURATION_MS {
                return invalid(format!("{name} {ms} exceeds {MAX_DURATION_MS}"));
            }
        }
        let (t_min, t_max) = TEMP_LIMIT_RANGE;
        if !(t_min..=t_max).contains(&self.temperature_limit_c) {
            return invalid(format!(
                "temperature_limit_c {} outside {t_min}..={t_max}",
                self.temperature_limit_c
            ));
        }
        if self.position_tolerance < 0 {
            return invalid("position_tolerance must not be negative".into());
        }
        if self.homing_step <= self.position_tolerance {
            return invalid(format!(
                "homing_step {} must exceed position_tolerance {}",
                self.homing_step, self.position_tolerance
            ));
        }
        if self.homing_step > POSITION_MAX {
            return invalid(format!(
                "homing_step {} exceeds full travel {POSITION_MAX}",
                self.homing_step
            ));
        }
        if !(1..=MAX_HOMING_ATTEMPTS).contains(&self.homing_max_attempts) {
            return invalid(format!(
                "homing_max_attempts must be within 1..={MAX_HOMING_ATTEMPTS}"
            ));
        }
        if self.move_timeout_ms == 0 {
            return invalid("move_timeout_ms must be positive".into());
        }
        if let Some(curve) = &self.calibration {
            check_curve_in_limits(curve, &self.limits).map_err(|msg| {
                ConfigError::Invalid(format!("{role}: {msg}"))
            })?;
        }
        Ok(())
    }
}

/// Check that every anchor of `curve` lies inside `limits`.
pub fn check_curve_in_limits(curve: &CalibrationCurve, limits: &TravelLimits) -> Result<(), String> {
    match curve
        .anchors()
        .iter()
        .find(|a| a.raw < limits.min || a.raw > limits.max)
    {
        Some(a) => Err(format!(
            "calibration anchor ({}, {}) lies outside limits [{}, {}]",
            a.logical, a.raw, limits.min, limits.max
        )),
        None => Ok(()),
    }
}

/// Complete controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial port of the bus adapter.
    pub port: String,
    pub baud_rate: u32,
    /// Reply timeout for a single frame exchange.
    pub command_timeout_ms: u64,
    /// How long a caller waits for the session to answer a request.
    pub request_timeout_ms: u64,
    /// Temperature and voltage refresh cadence.
    pub telemetry_interval_ms: u64,
    /// Age after which a position reading is reported stale.
    pub stale_after_ms: u64,
    #[serde(deserialize_with = "focuser_settings")]
    pub focuser: ServoSettings,
    #[serde(deserialize_with = "zoom_settings")]
    pub zoom: ServoSettings,
}

fn focuser_settings<'de, D>(deserializer: D) -> Result<ServoSettings, D::Error>
where
    D: Deserializer<'de>,
{
    servo_over_defaults(deserializer, ServoSettings::focuser_default())
}

fn zoom_settings<'de, D>(deserializer: D) -> Result<ServoSettings, D::Error>
where
    D: Deserializer<'de>,
{
    servo_over_defaults(deserializer, ServoSettings::zoom_default())
}

/// Read a servo block that may name only some fields, taking the rest from
/// `defaults`.
fn servo_over_defaults<'de, D>(deserializer: D, defaults: ServoSettings) -> Result<ServoSettings, D::Error>
where
    D: Deserializer<'de>,
{
    let patch = Value::deserialize(deserializer)?;
    let mut merged = serde_json::to_value(defaults).map_err(D::Error::custom)?;
    merge_json(&mut merged, patch);
    serde_json::from_value(merged).map_err(D::Error::custom)
}

/// Overlay `patch` onto `base`, recursing into objects. Arrays and scalars
/// replace what they overlay.
fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, patch) => *slot = patch,
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            command_timeout_ms: 200,
            request_timeout_ms: 2000,
            telemetry_interval_ms: 3000,
            stale_after_ms: 2000,
            focuser: ServoSettings::focuser_default(),
            zoom: ServoSettings::zoom_default(),
        }
    }
}

impl Settings {
    pub fn servo(&self, role: ServoRole) -> &ServoSettings {
        match role {
            ServoRole::Focuser => &self.focuser,
            ServoRole::Zoom => &self.zoom,
        }
    }

    pub fn servo_mut(&mut self, role: ServoRole) -> &mut ServoSettings {
        match role {
            ServoRole::Focuser => &mut self.focuser,
            ServoRole::Zoom => &mut self.zoom,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Serial link parameters.
    pub fn link_params(&self) -> LinkParams {
        LinkParams::new(self.port.clone())
            .with_baud_rate(self.baud_rate)
            .with_timeout(self.command_timeout())
    }

    /// Reject settings a session cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::Invalid("port is empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".into()));
        }
        if self.command_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        for (name, ms) in [
            ("command_timeout_ms", self.command_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("telemetry_interval_ms", self.telemetry_interval_ms),
            ("stale_after_ms", self.stale_after_ms),
        ] {
            if ms > MAX_DURATION_MS {
                return Err(ConfigError::Invalid(format!(
                    "{name} {ms} exceeds {MAX_DURATION_MS}"
                )));
            }
        }
        if self.focuser.id == self.zoom.id {
            return Err(ConfigError::Invalid(format!(
                "focuser and zoom share bus id {}",
                self.zoom.id
            )));
        }
        self.focuser.validate(ServoRole::Focuser)?;
        self.zoom.validate(ServoRole::Zoom)?;
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Settings persistence, rooted at `~/.scope_control` by default.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    root_path: PathBuf,
}

impl SettingsStore {
    /// Create a store at the default location (~/.scope_control)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(Self {
            root_path: PathBuf::from(home).join(".scope_control"),
        })
    }

    /// Create a store with a custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root_path.join(SETTINGS_FILE)
    }

    /// Load and validate the stored settings.
    pub fn load(&self) -> ConfigResult<Settings> {
        let path = self.settings_path();
        let settings = Settings::load_from_file(&path)?;
        settings.validate()?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load the stored settings, or defaults if none have been saved.
    pub fn load_or_default(&self) -> ConfigResult<Settings> {
        if self.settings_path().exists() {
            self.load()
        } else {
            info!(
                "No settings at {}, using defaults",
                self.settings_path().display()
            );
            Ok(Settings::default())
        }
    }

    /// Validate and save settings. Returns the path written.
    pub fn save(&self, settings: &Settings) -> ConfigResult<PathBuf> {
        settings.validate()?;
        std::fs::create_dir_all(&self.root_path)?;
        let path = self.settings_path();
        settings.save_to_file(&path)?;
        info!("Saved settings to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.zoom.id, 1);
        assert_eq!(settings.focuser.id, 2);
        assert_eq!(settings.zoom.limits.max, 1125);
        assert!(!settings.zoom.require_homing);
    }

    #[test]
    fn test_default_zoom_curve_spans_eyepiece() {
        let curve = Settings::default().zoom.calibration.unwrap();
        assert_eq!(curve.logical_range(), (8.0, 24.0));
        assert_eq!(curve.lookup(24.0).unwrap().raw, 1125);
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut settings = Settings::default();
        settings.focuser.id = settings.zoom.id;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut settings = Settings::default();
        settings.focuser.limits = TravelLimits::new(0, 500, 50);
        assert!(settings.validate().is_err());

        settings.focuser.limits = TravelLimits::new(600, 500, 50);
        assert!(settings.validate().is_err());

        settings.focuser.limits = TravelLimits::new(10, 1600, 50);
        assert!(settings.validate().is_err());

        settings.focuser.limits = TravelLimits::new(10, 1400, 0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_motion_parameters() {
        let mut settings = Settings::default();
        settings.zoom.max_velocity = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.zoom.homing_velocity = f64::NAN;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.zoom.homing_step = settings.zoom.position_tolerance;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.zoom.id = 254;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_motion_parameters() {
        let mut settings = Settings::default();
        settings.focuser.homing_velocity = 1e-300;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.zoom.max_velocity = 1e12;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.zoom.homing_max_attempts = u32::MAX;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.focuser.move_timeout_ms = u64::MAX;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.request_timeout_ms = u64::MAX;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.zoom.temperature_limit_c = 120;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_homing_bound_saturates() {
        let mut servo = ServoSettings::focuser_default();
        servo.homing_velocity = 1e-300;
        assert_eq!(servo.homing_bound(Duration::from_millis(200)), Duration::MAX);

        servo.homing_velocity = 60.0;
        servo.homing_max_attempts = u32::MAX;
        servo.settle_time_ms = u64::MAX;
        assert_eq!(servo.homing_bound(Duration::MAX), Duration::MAX);

        let bounded = ServoSettings::focuser_default().homing_bound(Duration::from_millis(200));
        assert!(bounded > Duration::ZERO && bounded < Duration::from_secs(600));
    }

    #[test]
    fn test_validate_rejects_curve_outside_limits() {
        let mut settings = Settings::default();
        settings.zoom.calibration = Some(
            CalibrationCurve::new(vec![Anchor::new(8.0, 100), Anchor::new(24.0, 1300)]).unwrap(),
        );
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("outside limits"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"port": "/dev/ttyACM3", "baud_rate": 57600}"#).unwrap();
        assert_eq!(settings.port, "/dev/ttyACM3");
        assert_eq!(settings.baud_rate, 57600);
        assert_eq!(settings.zoom, ServoSettings::zoom_default());
    }

    #[test]
    fn test_partial_servo_block_fills_role_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{"zoom": {"id": 3}, "focuser": {"limits": {"max": 1200}, "require_homing": false}}"#,
        )
        .unwrap();

        let mut zoom = ServoSettings::zoom_default();
        zoom.id = 3;
        assert_eq!(settings.zoom, zoom);

        let defaults = ServoSettings::focuser_default();
        assert_eq!(settings.focuser.id, defaults.id);
        assert_eq!(settings.focuser.limits.max, 1200);
        assert_eq!(settings.focuser.limits.min, defaults.limits.min);
        assert_eq!(settings.focuser.limits.max_step, defaults.limits.max_step);
        assert!(!settings.focuser.require_homing);
        assert!(!settings.focuser.release_after_move);
        settings.validate().unwrap();
    }

    #[test]
    fn test_partial_servo_block_rejects_bad_types() {
        let result: Result<Settings, _> = serde_json::from_str(r#"{"zoom": {"id": "one"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::with_path(dir.path().join("nested"));

        assert_eq!(store.load_or_default().unwrap(), Settings::default());

        let mut settings = Settings::default();
        settings.port = "/dev/ttyUSB3".into();
        settings.focuser.limits = TravelLimits::new(20, 1200, 100);
        let path = store.save(&settings).unwrap();
        assert!(path.ends_with(SETTINGS_FILE));

        assert_eq!(store.load().unwrap(), settings);
        assert_eq!(store.load_or_default().unwrap(), settings);
    }

    #[test]
    fn test_store_refuses_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::with_path(dir.path().to_path_buf());

        let mut settings = Settings::default();
        settings.zoom.id = settings.focuser.id;
        assert!(store.save(&settings).is_err());

        std::fs::write(store.settings_path(), "{ not json").unwrap();
        assert!(matches!(store.load(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_link_params_from_settings() {
        let params = Settings::default().link_params();
        assert_eq!(params.port, "/dev/ttyUSB0");
        assert_eq!(params.baud_rate, 115_200);
        assert_eq!(params.timeout, Duration::from_millis(200));
    }
}
