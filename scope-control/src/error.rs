//! Session-level error type.

use std::time::Duration;

use hardware::hiwonder::{CodecError, ServoError, ServoRole, TransportError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::motion::AxisState;

/// Errors surfaced to callers of the session and motion controller.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Port could not be opened or failed fatally. Requires a reconnect.
    #[error("link unavailable: {0}")]
    LinkUnavailable(String),

    /// A single exchange got no reply in time.
    #[error("{role}: no reply from servo")]
    Timeout { role: ServoRole },

    /// Reply failed its checksum, after the retry.
    #[error("{role}: corrupted reply: {detail}")]
    ChecksumError { role: ServoRole, detail: String },

    /// Reply was structurally invalid or answered the wrong request.
    #[error("{role}: malformed reply: {detail}")]
    MalformedFrame { role: ServoRole, detail: String },

    /// No calibrated raw position exists for a logical target.
    #[error("{role}: cannot place {target}: {reason}")]
    CalibrationOutOfRange {
        role: ServoRole,
        target: f64,
        reason: String,
    },

    /// A relative move would leave the travel limits. Nothing was sent.
    #[error("{role}: moving {delta:+} from {current} would leave [{min}, {max}]")]
    LimitReached {
        role: ServoRole,
        current: i32,
        delta: i32,
        min: i32,
        max: i32,
    },

    /// Homing could not establish a reference.
    #[error("{role}: homing failed: {reason}")]
    HomingFailed { role: ServoRole, reason: String },

    /// Operation attempted while disconnected.
    #[error("not connected")]
    NotConnected,

    /// Operation not allowed in the axis' current state.
    #[error("{role}: cannot {action} while {state}")]
    InvalidState {
        role: ServoRole,
        state: AxisState,
        action: &'static str,
    },

    #[error("{0} servo is disabled in settings")]
    RoleDisabled(ServoRole),

    /// Request was discarded by an emergency stop.
    #[error("cancelled by emergency stop")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No answer from the session worker within the caller's bound.
    #[error("session did not answer within {0:?}")]
    RequestTimeout(Duration),

    /// The session worker has exited.
    #[error("session worker is gone")]
    WorkerGone,
}

pub type ControlResult<T> = Result<T, ControlError>;

impl From<TransportError> for ControlError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::LinkUnavailable(reason) => ControlError::LinkUnavailable(reason),
            other => ControlError::LinkUnavailable(other.to_string()),
        }
    }
}

impl ControlError {
    /// Attribute a servo-layer failure to `role`.
    pub fn from_servo(role: ServoRole, err: ServoError) -> Self {
        match err {
            ServoError::Transport(TransportError::Timeout) => ControlError::Timeout { role },
            ServoError::Transport(TransportError::LinkUnavailable(reason)) => {
                ControlError::LinkUnavailable(reason)
            }
            ServoError::Transport(TransportError::Io(e)) => {
                ControlError::LinkUnavailable(e.to_string())
            }
            ServoError::Codec(e @ CodecError::Checksum { .. }) => ControlError::ChecksumError {
                role,
                detail: e.to_string(),
            },
            ServoError::Codec(CodecError::Malformed(detail)) => {
                ControlError::MalformedFrame { role, detail }
            }
            ServoError::InvalidArgument(msg) => ControlError::InvalidArgument(msg),
        }
    }

    /// Transient faults that leave the link usable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControlError::Timeout { .. }
                | ControlError::ChecksumError { .. }
                | ControlError::MalformedFrame { .. }
        )
    }
}
