//! Requests queued to the motion thread.

use crate::adapters::Endpoint;
use crate::axis::{Axis, PerAxisSpeed};
use tokio::sync::oneshot;

/// One requested transition of the rig state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Open the controller link and bring the controller up
    Connect {
        /// Where the controller is reached
        endpoint: Endpoint,
    },
    /// Stop, power down and close the link
    Disconnect,
    /// Stop any motion, keeping motors powered
    EnableStop,
    /// Stop and power down the motors; position becomes unknown
    DisableMotors,
    /// Continuous motion on one axis
    Jog {
        /// Axis to move
        axis: Axis,
        /// Direction of travel
        forward: bool,
    },
    /// Move by a displacement in centimetres
    MoveRelative {
        /// Lateral, transverse, vertical displacement
        delta: [f64; 3],
    },
    /// Move to a position in centimetres
    MoveAbsolute {
        /// Lateral, transverse, vertical target
        target: [f64; 3],
    },
    /// Establish the coordinate origin
    Home,
    /// Speed for subsequent moves and jogs
    SetSpeed {
        /// Requested stage speed
        cm_s: f64,
        /// The same speed in counts/s per axis
        speed: PerAxisSpeed,
    },
}

impl Request {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "connect",
            Request::Disconnect => "disconnect",
            Request::EnableStop => "stop",
            Request::DisableMotors => "disable_motors",
            Request::Jog { .. } => "jog",
            Request::MoveRelative { .. } => "move_relative",
            Request::MoveAbsolute { .. } => "move_absolute",
            Request::Home => "home",
            Request::SetSpeed { .. } => "set_speed",
        }
    }
}

/// A request tagged with its queue sequence number.
///
/// `done` resolves `true` when the motion started by this request settles and
/// `false` when it is refused, interrupted or abandoned.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub seq: u64,
    pub request: Request,
    pub done: Option<oneshot::Sender<bool>>,
}
