//! Rig state as seen by callers: `Status`, per-axis telemetry, errors.

use crate::axis::{Axis, AxisModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use crate::axis::Direction;

/// State of the whole rig.
///
/// `Disconnected` is the initial state and the terminal state of every
/// unrecoverable fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// No controller link
    #[default]
    Disconnected,
    /// Connected, motors unpowered, position unknown
    MotorsDisabled,
    /// Motors powered and idle
    Stopped,
    /// Continuous motion on one axis until stopped or a limit is hit
    Jogging,
    /// Relative move in progress
    MovingRelative,
    /// Absolute move in progress
    MovingAbsolute,
    /// Homing sequence in progress
    Homing,
}

impl Status {
    /// True for any state other than `Disconnected`.
    pub fn is_connected(self) -> bool {
        self != Status::Disconnected
    }

    /// States whose completion the poll loop detects from stop codes.
    pub fn is_moving(self) -> bool {
        matches!(
            self,
            Status::Jogging | Status::MovingRelative | Status::MovingAbsolute
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Disconnected => "Disconnected",
            Status::MotorsDisabled => "MotorsDisabled",
            Status::Stopped => "Stopped",
            Status::Jogging => "Jogging",
            Status::MovingRelative => "MovingRelative",
            Status::MovingAbsolute => "MovingAbsolute",
            Status::Homing => "Homing",
        };
        f.write_str(name)
    }
}

/// Reason the controller reports for the end (or absence of end) of motion on a channel.
///
/// Values follow the controller's `SC` operand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCode {
    /// Motion in progress
    RunningIndependent,
    /// Profiled move finished normally
    #[default]
    DecelStopIndependent,
    /// Stopped by the forward limit switch
    DecelStopFwdLim,
    /// Stopped by the reverse limit switch
    DecelStopRevLim,
    /// Stopped by an `ST` command
    DecelStopSt,
    /// Stopped by the abort input
    StopAbortInput,
    /// Stopped by the abort command
    StopAbortCommand,
    /// Stopped by off-on-error
    DecelStopOffOnError,
    /// Stopped after a find-edge
    StopFindEdge,
    /// Stopped after a home/find-index
    StopHomeFindIndex,
    /// Amplifier fault
    AmplifierFault,
    /// Stepper position error
    StepperPositionError,
    /// Motion-complete timeout
    McTimeout,
    /// Any code not listed above
    Unknown(i64),
}

impl StopCode {
    /// Decode a numeric stop code.
    pub fn from_code(code: i64) -> StopCode {
        match code {
            0 => StopCode::RunningIndependent,
            1 => StopCode::DecelStopIndependent,
            2 => StopCode::DecelStopFwdLim,
            3 => StopCode::DecelStopRevLim,
            4 => StopCode::DecelStopSt,
            6 => StopCode::StopAbortInput,
            7 => StopCode::StopAbortCommand,
            8 => StopCode::DecelStopOffOnError,
            9 => StopCode::StopFindEdge,
            10 => StopCode::StopHomeFindIndex,
            15 => StopCode::AmplifierFault,
            16 => StopCode::StepperPositionError,
            99 => StopCode::McTimeout,
            other => StopCode::Unknown(other),
        }
    }

    /// Numeric stop code.
    pub fn code(self) -> i64 {
        match self {
            StopCode::RunningIndependent => 0,
            StopCode::DecelStopIndependent => 1,
            StopCode::DecelStopFwdLim => 2,
            StopCode::DecelStopRevLim => 3,
            StopCode::DecelStopSt => 4,
            StopCode::StopAbortInput => 6,
            StopCode::StopAbortCommand => 7,
            StopCode::DecelStopOffOnError => 8,
            StopCode::StopFindEdge => 9,
            StopCode::StopHomeFindIndex => 10,
            StopCode::AmplifierFault => 15,
            StopCode::StepperPositionError => 16,
            StopCode::McTimeout => 99,
            StopCode::Unknown(code) => code,
        }
    }

    /// Whether the channel is still moving.
    pub fn is_running(self) -> bool {
        self == StopCode::RunningIndependent
    }

    /// Stop code produced by running into the limit in `direction`.
    pub fn limit_for(direction: Direction) -> Option<StopCode> {
        match direction {
            Direction::Forward => Some(StopCode::DecelStopFwdLim),
            Direction::Backward => Some(StopCode::DecelStopRevLim),
            Direction::None => None,
        }
    }
}

impl fmt::Display for StopCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Whether an axis is pinned against one of its travel boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitState {
    /// On the reverse limit (or below the software floor)
    AtNegative,
    /// Free to move both ways
    #[default]
    Clear,
    /// On the forward limit (or above the software ceiling)
    AtPositive,
}

impl LimitState {
    /// Whether motion in `direction` would push further into the active limit.
    pub fn blocks(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (LimitState::AtPositive, Direction::Forward)
                | (LimitState::AtNegative, Direction::Backward)
        )
    }

    /// Limit reached when travelling in `direction`.
    pub fn reached_by(direction: Direction) -> LimitState {
        match direction {
            Direction::Forward => LimitState::AtPositive,
            Direction::Backward => LimitState::AtNegative,
            Direction::None => LimitState::Clear,
        }
    }
}

/// Last polled state of one axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisTelemetry {
    /// Controller position in counts; meaningful only after homing
    pub position_counts: i64,
    /// Most recent stop code
    pub stop_code: StopCode,
    /// Derived limit classification
    pub limit_state: LimitState,
    /// Direction the axis was last commanded
    pub movement_direction: Direction,
}

/// Telemetry for all three axes, indexed by [`Axis::index`].
pub type PerAxisTelemetry = [AxisTelemetry; 3];

/// Category of a recorded fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Under-voltage or over-current on an amplifier
    OverVoltageOrCurrent,
    /// Hall sensor error
    HallSensorFault,
    /// Peak current exceeded
    PeakCurrentFault,
    /// Electronic lock-out latched
    EmergencyStopLatched,
    /// Controller link failed
    CommunicationFault,
    /// Unexpected stop code, sensor state or failed connection
    Other,
}

impl ErrorKind {
    /// The four controller fault flags in `TA0`..`TA3` order.
    pub const CONTROLLER_FLAGS: [ErrorKind; 4] = [
        ErrorKind::OverVoltageOrCurrent,
        ErrorKind::HallSensorFault,
        ErrorKind::PeakCurrentFault,
        ErrorKind::EmergencyStopLatched,
    ];

    /// Operator-facing description.
    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::OverVoltageOrCurrent => "Undervoltage or over current error",
            ErrorKind::HallSensorFault => "Hall error",
            ErrorKind::PeakCurrentFault => "Peak current error",
            ErrorKind::EmergencyStopLatched => "ELO",
            ErrorKind::CommunicationFault => "Controller communication error",
            ErrorKind::Other => "Other error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Faults recorded by the motion thread, keyed by kind.
///
/// Entries stay until a caller clears them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSet(BTreeMap<ErrorKind, String>);

impl ErrorSet {
    /// Record a fault, replacing any earlier message of the same kind.
    pub fn insert(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.0.insert(kind, message.into());
    }

    /// Whether a fault of this kind is recorded.
    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.0.contains_key(&kind)
    }

    /// Message recorded for a kind.
    pub fn get(&self, kind: ErrorKind) -> Option<&str> {
        self.0.get(&kind).map(String::as_str)
    }

    /// Whether no fault is recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of recorded kinds.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Entries in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (ErrorKind, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Recorded kinds in order.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        self.0.keys().copied().collect()
    }
}

/// Consistent view of the rig published by the motion thread after every loop iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RigSnapshot {
    /// Current state
    pub status: Status,
    /// Per-axis telemetry
    pub telemetry: PerAxisTelemetry,
    /// Homing has completed since the last connect
    pub position_known: bool,
    /// Recorded faults
    pub errors: ErrorSet,
    /// Reason the last connect attempt failed, if it did
    pub connect_error: Option<String>,
    /// Endpoint of the open link
    pub endpoint: Option<String>,
    /// Stage speed (cm/s) applied to moves and jogs
    pub speed_cm_s: f64,
    /// Sequence number of the last request taken off the queue
    pub processed_seq: u64,
    /// Sequence number of the last motion request that finished in `Stopped`
    pub settled_seq: u64,
    /// Sequence number of the move or jog in progress
    pub motion_seq: Option<u64>,
}

impl RigSnapshot {
    /// Position in counts, if homed and motors are powered.
    pub fn position_counts(&self) -> Option<[i64; 3]> {
        match self.status {
            Status::Disconnected | Status::MotorsDisabled => None,
            _ if !self.position_known => None,
            _ => Some(self.telemetry.map(|t| t.position_counts)),
        }
    }

    /// Position in centimetres, if homed and motors are powered.
    pub fn position_cm(&self, model: &AxisModel) -> Option<[f64; 3]> {
        self.position_counts()
            .map(|counts| model.to_distance_all(counts))
    }

    /// Limit state of one axis.
    pub fn limit_state(&self, axis: Axis) -> LimitState {
        self.telemetry[axis.index()].limit_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_code_round_trip_and_unknown() {
        for code in [0, 1, 2, 3, 4, 6, 7, 8, 9, 10, 15, 16, 99] {
            assert_eq!(StopCode::from_code(code).code(), code);
        }
        assert_eq!(StopCode::from_code(42), StopCode::Unknown(42));
        assert!(StopCode::from_code(0).is_running());
        assert!(!StopCode::from_code(4).is_running());
    }

    #[test]
    fn limit_blocks_only_into_the_switch() {
        assert!(LimitState::AtPositive.blocks(Direction::Forward));
        assert!(!LimitState::AtPositive.blocks(Direction::Backward));
        assert!(LimitState::AtNegative.blocks(Direction::Backward));
        assert!(!LimitState::Clear.blocks(Direction::Forward));
        assert!(!LimitState::AtNegative.blocks(Direction::None));
    }

    #[test]
    fn position_hidden_until_homed() {
        let mut snapshot = RigSnapshot {
            status: Status::Stopped,
            ..Default::default()
        };
        snapshot.telemetry[0].position_counts = 4385;
        assert_eq!(snapshot.position_counts(), None);

        snapshot.position_known = true;
        let cm = snapshot.position_cm(&AxisModel::default()).unwrap();
        assert!((cm[0] - 1.0).abs() < 1e-9);

        snapshot.status = Status::MotorsDisabled;
        assert_eq!(snapshot.position_counts(), None);
    }

    #[test]
    fn error_set_keeps_one_entry_per_kind() {
        let mut errors = ErrorSet::default();
        errors.insert(ErrorKind::Other, "first");
        errors.insert(ErrorKind::Other, "second");
        errors.insert(ErrorKind::HallSensorFault, ErrorKind::HallSensorFault.description());
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.get(ErrorKind::Other), Some("second"));
        assert_eq!(
            errors.kinds(),
            vec![ErrorKind::HallSensorFault, ErrorKind::Other]
        );
        errors.clear();
        assert!(errors.is_empty());
    }
}
