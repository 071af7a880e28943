//! Remote control core for a telescope focuser and zoom eyepiece.
//!
//! Both are HX-35 bus servos sharing one serial link. The layers are:
//!
//! - [`calibration`] - logical value to raw position curves
//! - [`config`] - settings and their JSON storage
//! - [`motion`] - per-axis state machines, moves and homing
//! - [`session`] - the worker thread that owns the link and serves requests
//!
//! Bus framing, transports and per-servo proxies live in
//! `hardware::hiwonder`.

pub mod calibration;
pub mod config;
pub mod error;
pub mod motion;
pub mod session;

pub use calibration::{Anchor, CalibrationCurve};
pub use config::{ServoSettings, Settings, SettingsStore};
pub use error::{ControlError, ControlResult};
pub use motion::{AxisState, MotionController, MoveReport, PositionEstimate};
pub use session::{serial_connector, simulated_connector, LinkStatus, Request, Session, Worker};
