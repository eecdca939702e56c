//! Custom error types for the rig.
//!
//! Failures fall into the four groups the controller distinguishes:
//!
//! - **Transport faults** ([`CommError`]): the byte stream to the motion controller failed,
//!   timed out, or the controller rejected a command. Inside the background loop these are
//!   unrecoverable for the session and force `Status::Disconnected`.
//! - **Connection failures** ([`ConnectError`]): the endpoint could not be opened, or the
//!   controller reported fault flags that the clear sequence could not remove.
//! - **Caller-input violations** ([`OutOfRange`]): returned synchronously to the caller,
//!   e.g. a speed outside the configured envelope.
//! - **Everything else** ([`RigError`]): the crate-level umbrella used by configuration
//!   loading, the public handle and the CLI.
//!
//! Hardware faults and protocol-state violations detected by the background thread are never
//! returned as `Err` across the thread boundary; they are written into the shared
//! [`ErrorSet`](crate::controller::ErrorSet) instead.

use crate::controller::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Failure of a single command/response exchange with the motion controller.
#[derive(Error, Debug)]
pub enum CommError {
    /// No channel is open.
    #[error("Controller link not open")]
    NotConnected,

    /// The endpoint could not be opened.
    #[error("Failed to open {endpoint}: {reason}")]
    Open {
        /// Endpoint as given by the caller.
        endpoint: String,
        /// Underlying failure.
        reason: String,
    },

    /// Underlying I/O error on the channel.
    #[error("Controller I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The controller closed the stream.
    #[error("Unexpected EOF from controller")]
    UnexpectedEof,

    /// No response terminator arrived in time.
    #[error("No response to '{command}' within {timeout:?}")]
    Timeout {
        /// Command that went unanswered.
        command: String,
        /// Configured response timeout.
        timeout: Duration,
    },

    /// The controller answered with its error marker.
    #[error("Controller rejected '{command}': {reason}")]
    Rejected {
        /// Rejected command.
        command: String,
        /// Error text reported by the controller, if it could be read.
        reason: String,
    },

    /// The response could not be parsed as the expected type.
    #[error("Malformed response to '{command}': {response:?}")]
    Malformed {
        /// Command whose response was malformed.
        command: String,
        /// Raw response text.
        response: String,
    },

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

/// Failure of a `Connect` request.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The transport could not be opened or failed during bring-up.
    #[error("Connection failed: {0}")]
    Transport(#[from] CommError),

    /// Fault flags were still latched after the clear sequence.
    #[error("Controller faults could not be cleared: {0:?}")]
    FaultClearFailed(Vec<ErrorKind>),
}

impl ConnectError {
    /// Error-set entries this failure should produce.
    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        match self {
            ConnectError::Transport(_) => vec![ErrorKind::CommunicationFault],
            ConnectError::FaultClearFailed(kinds) if kinds.is_empty() => vec![ErrorKind::Other],
            ConnectError::FaultClearFailed(kinds) => kinds.clone(),
        }
    }
}

/// A caller-supplied value fell outside its configured envelope.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("{quantity} {value} outside [{min}, {max}]")]
pub struct OutOfRange {
    /// What was being set, e.g. `"speed"`.
    pub quantity: &'static str,
    /// Offending value.
    pub value: f64,
    /// Inclusive lower bound.
    pub min: f64,
    /// Inclusive upper bound.
    pub max: f64,
}

/// Crate-level error type.
#[derive(Error, Debug)]
pub enum RigError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Communication failure surfaced synchronously.
    #[error(transparent)]
    Comm(#[from] CommError),

    /// Connection failure surfaced synchronously.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Caller input out of range.
    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),

    /// An endpoint string could not be interpreted.
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// The background motion thread has stopped and no longer accepts requests.
    #[error("Motion controller thread is not running")]
    ControllerGone,

    /// The background runtime or thread could not be started.
    #[error("Failed to start motion thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<figment::Error> for RigError {
    fn from(err: figment::Error) -> Self {
        RigError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_message_names_bounds() {
        let err = OutOfRange {
            quantity: "speed",
            value: 7.5,
            min: 0.2,
            max: 6.0,
        };
        assert_eq!(err.to_string(), "speed 7.5 outside [0.2, 6]");
    }

    #[test]
    fn connect_error_maps_to_error_kinds() {
        let comm = ConnectError::from(CommError::NotConnected);
        assert_eq!(comm.error_kinds(), vec![ErrorKind::CommunicationFault]);

        let faults = ConnectError::FaultClearFailed(vec![
            ErrorKind::OverVoltageOrCurrent,
            ErrorKind::EmergencyStopLatched,
        ]);
        assert_eq!(
            faults.error_kinds(),
            vec![ErrorKind::OverVoltageOrCurrent, ErrorKind::EmergencyStopLatched]
        );
        assert_eq!(
            ConnectError::FaultClearFailed(vec![]).error_kinds(),
            vec![ErrorKind::Other]
        );
    }

    #[test]
    fn rig_error_wraps_sources() {
        let err: RigError = CommError::UnexpectedEof.into();
        assert!(matches!(err, RigError::Comm(CommError::UnexpectedEof)));
        assert_eq!(err.to_string(), "Unexpected EOF from controller");
    }
}
