//! Simulated motion controller.
//!
//! [`DummyRig`] is a cloneable handle on an in-process model of the controller and
//! stage; [`DummyTransport`] speaks the controller's command language against it.
//! Tests keep a `DummyRig` clone to inspect the command log, inject faults and
//! read back the simulated stage.
//!
//! Motion is deterministic: a moving channel advances one step each time its stop
//! code (`MG_SC`) is queried. Limit switches are regions of travel; a forward
//! switch is active at or beyond its boundary, a reverse switch at or below its
//! boundary. The lateral axis has one shared sensor, so both of its inputs read
//! active whenever it is inside either region.
//!
//! The command log keeps the most recent [`COMMAND_LOG_CAPACITY`] entries, so a
//! long-running simulated session stays bounded.

use super::{Endpoint, Transport};
use crate::axis::{Axis, Channel};
use crate::config::MotionConfig;
use crate::controller::ErrorKind;
use crate::error::CommError;
use crate::protocol::{Command, LimitDisable, Query};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Number of commands the simulator remembers.
pub const COMMAND_LOG_CAPACITY: usize = 50_000;

/// Physical arrangement of the simulated stage, in centimetres.
#[derive(Debug, Clone, PartialEq)]
pub struct SimLayout {
    /// Initial stage position per axis
    pub start_cm: [f64; 3],
    /// Forward switch boundary per axis; active at or above
    pub forward_switch_cm: [Option<f64>; 3],
    /// Reverse switch boundary per axis; active at or below
    pub reverse_switch_cm: [Option<f64>; 3],
    /// Distance moved per stop-code poll while running
    pub step_cm: [f64; 3],
    /// Counts per centimetre, matching the controller configuration
    pub counts_per_cm: [f64; 3],
}

impl Default for SimLayout {
    fn default() -> Self {
        Self {
            start_cm: [10.0, 10.0, -5.0],
            forward_switch_cm: [Some(60.0), Some(130.0), Some(0.0)],
            reverse_switch_cm: [Some(0.0), Some(0.0), Some(-30.0)],
            step_cm: [0.5, 0.5, 0.5],
            counts_per_cm: MotionConfig::default().counts_per_cm,
        }
    }
}

impl SimLayout {
    /// Set the initial position of one axis.
    pub fn with_start(mut self, axis: Axis, cm: f64) -> Self {
        self.start_cm[axis.index()] = cm;
        self
    }

    /// Set both switch boundaries of one axis.
    pub fn with_switches(mut self, axis: Axis, reverse: Option<f64>, forward: Option<f64>) -> Self {
        self.reverse_switch_cm[axis.index()] = reverse;
        self.forward_switch_cm[axis.index()] = forward;
        self
    }

    /// Set the step size of one axis.
    pub fn with_step(mut self, axis: Axis, cm: f64) -> Self {
        self.step_cm[axis.index()] = cm;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pending {
    None,
    Relative(i64),
    Absolute(i64),
    Jog(i64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Motion {
    direction: i64,
    target: Option<i64>,
}

#[derive(Debug, Clone)]
struct SimAxis {
    physical: i64,
    offset: i64,
    forward_boundary: Option<i64>,
    reverse_boundary: Option<i64>,
    shared_sensor: bool,
    step: i64,
    limit_disable: LimitDisable,
    speed: i64,
    pending: Pending,
    motion: Option<Motion>,
    stop_code: i64,
    back_limit: Option<i64>,
    forward_limit: Option<i64>,
    injected_stop_code: Option<i64>,
}

impl SimAxis {
    fn in_forward_region(&self, pos: i64) -> bool {
        self.forward_boundary.is_some_and(|b| pos >= b)
    }

    fn in_reverse_region(&self, pos: i64) -> bool {
        self.reverse_boundary.is_some_and(|b| pos <= b)
    }

    fn forward_input(&self, pos: i64) -> bool {
        if self.shared_sensor {
            self.in_forward_region(pos) || self.in_reverse_region(pos)
        } else {
            self.in_forward_region(pos)
        }
    }

    fn reverse_input(&self, pos: i64) -> bool {
        if self.shared_sensor {
            self.in_forward_region(pos) || self.in_reverse_region(pos)
        } else {
            self.in_reverse_region(pos)
        }
    }

    fn reported(&self) -> i64 {
        self.physical - self.offset
    }

    // Input that would stop motion in `direction` at `pos`.
    fn blocking_input(&self, direction: i64, pos: i64) -> bool {
        match direction.signum() {
            1 => self.limit_disable.forward_enabled() && self.forward_input(pos),
            -1 => self.limit_disable.reverse_enabled() && self.reverse_input(pos),
            _ => false,
        }
    }

    fn begin(&mut self) {
        let (direction, target) = match self.pending {
            Pending::None => (0, None),
            Pending::Relative(d) => (d.signum(), Some(self.physical + d)),
            Pending::Absolute(t) => {
                let target = t + self.offset;
                ((target - self.physical).signum(), Some(target))
            }
            Pending::Jog(v) => (v.signum(), None),
        };
        if direction == 0 {
            self.motion = None;
            self.stop_code = 1;
        } else {
            self.motion = Some(Motion { direction, target });
            self.stop_code = 0;
        }
    }

    fn advance(&mut self) {
        let Some(motion) = self.motion else {
            return;
        };
        let old = self.physical;
        let mut next = old + motion.direction * self.step;
        let mut code = None;

        if let Some(target) = motion.target {
            let reached = if motion.direction > 0 {
                next >= target
            } else {
                next <= target
            };
            if reached {
                next = target;
                code = Some(1);
            }
        }

        if self.blocking_input(motion.direction, next) {
            next = if self.blocking_input(motion.direction, old) {
                old
            } else if motion.direction > 0 {
                self.first_active(old, next, 1)
            } else {
                self.first_active(old, next, -1)
            };
            code = Some(self.injected_stop_code.take().unwrap_or(if motion.direction > 0 {
                2
            } else {
                3
            }));
        }

        self.physical = next;
        if let Some(code) = code {
            self.motion = None;
            self.stop_code = code;
        }
    }

    // Boundary crossed between `old` and `next` travelling in `direction`.
    fn first_active(&self, old: i64, next: i64, direction: i64) -> i64 {
        let boundaries = [self.forward_boundary, self.reverse_boundary];
        boundaries
            .into_iter()
            .flatten()
            .filter(|b| {
                if direction > 0 {
                    old < *b && *b <= next
                } else {
                    next <= *b && *b < old
                }
            })
            .min_by_key(|b| (b - old).abs())
            .unwrap_or(next)
    }
}

#[derive(Debug)]
struct SimState {
    axes: [SimAxis; 3],
    counts_per_cm: [f64; 3],
    motors_on: bool,
    open: bool,
    endpoint: Option<Endpoint>,
    link_lost: bool,
    fail_next_open: Option<String>,
    faults: [bool; 4],
    sticky: [bool; 4],
    last_error: String,
    log: CommandLog,
}

#[derive(Debug, Default)]
struct CommandLog {
    entries: VecDeque<String>,
    // Entries evicted so far; keeps positions stable across eviction
    evicted: usize,
}

impl CommandLog {
    fn push(&mut self, command: &str) {
        if self.entries.len() == COMMAND_LOG_CAPACITY {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(command.to_string());
    }

    fn total(&self) -> usize {
        self.evicted + self.entries.len()
    }

    fn since(&self, start: usize) -> Vec<String> {
        let skip = start.saturating_sub(self.evicted);
        self.entries.iter().skip(skip).cloned().collect()
    }

    fn clear(&mut self) {
        self.evicted += self.entries.len();
        self.entries.clear();
    }
}

impl SimState {
    fn new(layout: &SimLayout) -> Self {
        let axes = Axis::ALL.map(|axis| {
            let i = axis.index();
            let cnt = layout.counts_per_cm[i];
            let counts = |cm: f64| (cm * cnt).floor() as i64;
            SimAxis {
                physical: counts(layout.start_cm[i]),
                offset: 0,
                forward_boundary: layout.forward_switch_cm[i].map(counts),
                reverse_boundary: layout.reverse_switch_cm[i].map(counts),
                shared_sensor: axis.has_shared_limit_sensor(),
                step: counts(layout.step_cm[i]).max(1),
                limit_disable: LimitDisable::None,
                speed: 0,
                pending: Pending::None,
                motion: None,
                stop_code: 1,
                back_limit: None,
                forward_limit: None,
                injected_stop_code: None,
            }
        });
        Self {
            axes,
            counts_per_cm: layout.counts_per_cm,
            motors_on: false,
            open: false,
            endpoint: None,
            link_lost: false,
            fail_next_open: None,
            faults: [false; 4],
            sticky: [false; 4],
            last_error: String::new(),
            log: CommandLog::default(),
        }
    }

    // The slave channel C mirrors its master B.
    fn axis_index(channel: Channel) -> usize {
        match channel {
            Channel::A => 0,
            Channel::B | Channel::C => 1,
            Channel::D => 2,
        }
    }

    fn axis_mut(&mut self, channel: Channel) -> &mut SimAxis {
        &mut self.axes[Self::axis_index(channel)]
    }

    fn reject(&mut self, command: &str, reason: &str) -> Result<String, CommError> {
        self.last_error = reason.to_string();
        Err(CommError::Rejected {
            command: command.to_string(),
            reason: reason.to_string(),
        })
    }

    fn query(&mut self, query: Query) -> f64 {
        match query {
            Query::Position(ch) => self.axes[Self::axis_index(ch)].reported() as f64,
            Query::StopCode(ch) => {
                let axis = self.axis_mut(ch);
                axis.advance();
                axis.stop_code as f64
            }
            Query::ForwardLimit(ch) => {
                let axis = &self.axes[Self::axis_index(ch)];
                if axis.forward_input(axis.physical) {
                    0.0
                } else {
                    1.0
                }
            }
            Query::ReverseLimit(ch) => {
                let axis = &self.axes[Self::axis_index(ch)];
                if axis.reverse_input(axis.physical) {
                    0.0
                } else {
                    1.0
                }
            }
            Query::Fault(n) => {
                if self.faults[usize::from(n)] {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    fn apply(&mut self, raw: &str, command: Command) -> Result<String, CommError> {
        match command {
            Command::Reset => {
                for axis in &mut self.axes {
                    axis.offset = axis.physical;
                    axis.motion = None;
                    axis.pending = Pending::None;
                    axis.limit_disable = LimitDisable::None;
                    axis.stop_code = 1;
                    axis.back_limit = None;
                    axis.forward_limit = None;
                }
                self.motors_on = false;
            }
            Command::MotorsOff => {
                for axis in &mut self.axes {
                    if axis.motion.take().is_some() {
                        axis.stop_code = 4;
                    }
                }
                self.motors_on = false;
            }
            Command::ServoHere => {
                self.motors_on = true;
                for (fault, sticky) in self.faults.iter_mut().zip(self.sticky) {
                    if !sticky {
                        *fault = false;
                    }
                }
            }
            Command::Stop => {
                for axis in &mut self.axes {
                    if axis.motion.take().is_some() {
                        axis.stop_code = 4;
                    }
                }
            }
            Command::Speed(ch, v) => self.axis_mut(ch).speed = v,
            Command::PositionRelative(ch, v) => self.axis_mut(ch).pending = Pending::Relative(v),
            Command::PositionAbsolute(ch, v) => self.axis_mut(ch).pending = Pending::Absolute(v),
            Command::Jog(ch, v) => self.axis_mut(ch).pending = Pending::Jog(v),
            Command::LimitDisable(ch, mode) => self.axis_mut(ch).limit_disable = mode,
            Command::BackLimit(ch, v) => self.axis_mut(ch).back_limit = Some(v),
            Command::ForwardLimit(ch, v) => self.axis_mut(ch).forward_limit = Some(v),
            Command::DefinePosition(ch, v) => {
                let axis = self.axis_mut(ch);
                axis.offset = axis.physical - v;
            }
            Command::Begin(channels) => {
                if !self.motors_on {
                    return self.reject(raw, "20 Begin not valid with motor off");
                }
                for ch in &channels {
                    let axis = &self.axes[Self::axis_index(*ch)];
                    if axis.motion.is_some() {
                        return self.reject(raw, "21 Begin not valid while running");
                    }
                    let direction = match axis.pending {
                        Pending::Relative(d) => d.signum(),
                        Pending::Absolute(t) => (t + axis.offset - axis.physical).signum(),
                        Pending::Jog(v) => v.signum(),
                        Pending::None => 0,
                    };
                    if axis.blocking_input(direction, axis.physical) {
                        return self.reject(raw, "22 Begin not valid due to limit switch");
                    }
                }
                for ch in channels {
                    self.axis_mut(ch).begin();
                }
            }
            Command::TellError => {
                let reason = if self.last_error.is_empty() {
                    "0 No error".to_string()
                } else {
                    self.last_error.clone()
                };
                return Ok(reason);
            }
            Command::EchoOff
            | Command::MotorType(_)
            | Command::AmplifierGain(_)
            | Command::Gang { .. }
            | Command::GearRatio(..)
            | Command::GantryMode(..) => {}
        }
        Ok(String::new())
    }

    fn handle(&mut self, raw: &str) -> Result<String, CommError> {
        if raw.starts_with("MG_") {
            return match raw.parse::<Query>() {
                Ok(query) => Ok(format!("{:.4}", self.query(query))),
                Err(_) => self.reject(raw, "1 Unrecognized command"),
            };
        }
        match raw.parse::<Command>() {
            Ok(command) => self.apply(raw, command),
            Err(_) => self.reject(raw, "1 Unrecognized command"),
        }
    }
}

/// Handle on a simulated controller and stage.
#[derive(Debug, Clone)]
pub struct DummyRig {
    state: Arc<Mutex<SimState>>,
}

impl Default for DummyRig {
    fn default() -> Self {
        Self::new(SimLayout::default())
    }
}

impl DummyRig {
    /// Simulated rig with the given physical layout.
    pub fn new(layout: SimLayout) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(&layout))),
        }
    }

    /// Transport talking to this rig.
    pub fn transport(&self) -> DummyTransport {
        DummyTransport { rig: self.clone() }
    }

    /// Retained commands received while open, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.entries.iter().cloned().collect()
    }

    /// Retained commands received after the first `start` commands.
    pub fn commands_since(&self, start: usize) -> Vec<String> {
        self.state.lock().log.since(start)
    }

    /// Number of commands received so far, including evicted ones.
    pub fn log_len(&self) -> usize {
        self.state.lock().log.total()
    }

    /// Logged commands that set up or start motion (`PR`, `PA`, `JG`, `BG`).
    pub fn motion_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .log
            .entries
            .iter()
            .filter(|c| c.parse::<Command>().is_ok_and(|c| c.is_motion()))
            .cloned()
            .collect()
    }

    /// Forget logged commands.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Report `code` instead of the limit stop code the next time a limit
    /// switch ends motion on `axis`.
    pub fn inject_stop_code(&self, axis: Axis, code: i64) {
        self.state.lock().axes[axis.index()].injected_stop_code = Some(code);
    }

    /// Latch a controller fault; `SH` clears it.
    pub fn inject_fault(&self, kind: ErrorKind) {
        if let Some(i) = fault_index(kind) {
            self.state.lock().faults[i] = true;
        }
    }

    /// Latch a controller fault that survives `SH`.
    pub fn inject_sticky_fault(&self, kind: ErrorKind) {
        if let Some(i) = fault_index(kind) {
            let mut state = self.state.lock();
            state.faults[i] = true;
            state.sticky[i] = true;
        }
    }

    /// Clear every fault, sticky or not.
    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.faults = [false; 4];
        state.sticky = [false; 4];
    }

    /// Make every command fail as if the cable were pulled.
    pub fn drop_link(&self) {
        self.state.lock().link_lost = true;
    }

    /// Undo [`DummyRig::drop_link`].
    pub fn restore_link(&self) {
        self.state.lock().link_lost = false;
    }

    /// Make the next open attempt fail.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.state.lock().fail_next_open = Some(reason.into());
    }

    /// Whether a transport currently has the link open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Endpoint of the last successful open.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.state.lock().endpoint.clone()
    }

    /// Whether motors are powered.
    pub fn motors_on(&self) -> bool {
        self.state.lock().motors_on
    }

    /// Whether an axis is moving.
    pub fn is_moving(&self, axis: Axis) -> bool {
        self.state.lock().axes[axis.index()].motion.is_some()
    }

    /// Stage position in centimetres, independent of the controller counter.
    pub fn physical_position_cm(&self, axis: Axis) -> f64 {
        let state = self.state.lock();
        state.axes[axis.index()].physical as f64 / state.counts_per_cm[axis.index()]
    }

    /// Controller counter of an axis.
    pub fn reported_counts(&self, axis: Axis) -> i64 {
        self.state.lock().axes[axis.index()].reported()
    }

    /// Last `SP` value written to an axis, in counts/s.
    pub fn speed(&self, axis: Axis) -> i64 {
        self.state.lock().axes[axis.index()].speed
    }

    /// Current `LD` setting of an axis.
    pub fn limit_disable(&self, axis: Axis) -> LimitDisable {
        self.state.lock().axes[axis.index()].limit_disable
    }

    /// Software limits written with `BL`/`FL`, as (back, forward).
    pub fn software_limits(&self, axis: Axis) -> (Option<i64>, Option<i64>) {
        let state = self.state.lock();
        let a = &state.axes[axis.index()];
        (a.back_limit, a.forward_limit)
    }
}

fn fault_index(kind: ErrorKind) -> Option<usize> {
    ErrorKind::CONTROLLER_FLAGS.iter().position(|k| *k == kind)
}

/// [`Transport`] backed by a [`DummyRig`].
#[derive(Debug, Clone)]
pub struct DummyTransport {
    rig: DummyRig,
}

impl DummyTransport {
    /// The simulated rig behind this transport.
    pub fn rig(&self) -> &DummyRig {
        &self.rig
    }
}

#[async_trait]
impl Transport for DummyTransport {
    async fn open(&mut self, endpoint: &Endpoint) -> Result<(), CommError> {
        let mut state = self.rig.state.lock();
        if let Some(reason) = state.fail_next_open.take() {
            return Err(CommError::Open {
                endpoint: endpoint.to_string(),
                reason,
            });
        }
        if state.link_lost {
            return Err(CommError::Open {
                endpoint: endpoint.to_string(),
                reason: "no route to controller".to_string(),
            });
        }
        state.open = true;
        state.endpoint = Some(endpoint.clone());
        Ok(())
    }

    async fn command(&mut self, command: &str) -> Result<String, CommError> {
        let mut state = self.rig.state.lock();
        if !state.open {
            return Err(CommError::NotConnected);
        }
        state.log.push(command);
        if state.link_lost {
            return Err(CommError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated link loss",
            )));
        }
        state.handle(command)
    }

    async fn close(&mut self) -> Result<(), CommError> {
        self.rig.state.lock().open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.rig.state.lock().open
    }

    fn describe(&self) -> String {
        "Dummy DMC (simulated)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(rig: &DummyRig) -> DummyTransport {
        let mut transport = rig.transport();
        transport.open(&"COM4".parse().unwrap()).await.unwrap();
        transport
    }

    async fn run_until_stopped(t: &mut DummyTransport, channel: char) -> String {
        let query = format!("MG_SC{}", channel);
        for _ in 0..10_000 {
            let code = t.command(&query).await.unwrap();
            if code != "0.0000" {
                return code;
            }
        }
        panic!("channel {} never stopped", channel);
    }

    #[tokio::test]
    async fn reset_zeroes_counter_and_dp_redefines_it() {
        let rig = DummyRig::default();
        let mut t = open(&rig).await;
        assert_eq!(t.command("MG_TDA").await.unwrap(), "43850.0000");
        t.command("RS").await.unwrap();
        assert_eq!(t.command("MG_TDA").await.unwrap(), "0.0000");
        t.command("DPA=100").await.unwrap();
        assert_eq!(rig.reported_counts(Axis::Lateral), 100);
    }

    #[tokio::test]
    async fn relative_move_steps_to_target() {
        let rig = DummyRig::default();
        let mut t = open(&rig).await;
        t.command("SH").await.unwrap();
        t.command("PRA=4385").await.unwrap();
        t.command("BGA").await.unwrap();
        assert!(rig.is_moving(Axis::Lateral));

        assert_eq!(run_until_stopped(&mut t, 'A').await, "1.0000");
        assert!((rig.physical_position_cm(Axis::Lateral) - 11.0).abs() < 1e-9);
        assert_eq!(rig.motion_commands(), vec!["PRA=4385", "BGA"]);
    }

    #[tokio::test]
    async fn jog_stops_at_enabled_switch() {
        let rig = DummyRig::default();
        let mut t = open(&rig).await;
        t.command("SH").await.unwrap();
        t.command("JGD=1000").await.unwrap();
        t.command("BGD").await.unwrap();

        assert_eq!(run_until_stopped(&mut t, 'D').await, "2.0000");
        assert_eq!(rig.physical_position_cm(Axis::Vertical), 0.0);
        assert_eq!(t.command("MG_LFD").await.unwrap(), "0.0000");
        assert_eq!(t.command("MG_LRD").await.unwrap(), "1.0000");
    }

    #[tokio::test]
    async fn begin_into_active_switch_is_rejected() {
        let layout = SimLayout::default().with_start(Axis::Vertical, 0.0);
        let rig = DummyRig::new(layout);
        let mut t = open(&rig).await;
        t.command("SH").await.unwrap();
        t.command("JGD=1000").await.unwrap();

        let err = t.command("BGD").await.unwrap_err();
        assert!(matches!(err, CommError::Rejected { .. }));
        assert!(!rig.is_moving(Axis::Vertical));

        // Leaving the switch is allowed
        t.command("JGD=-1000").await.unwrap();
        t.command("BGD").await.unwrap();
        assert!(rig.is_moving(Axis::Vertical));
    }

    #[tokio::test]
    async fn shared_sensor_reads_active_on_both_inputs() {
        let layout = SimLayout::default().with_start(Axis::Lateral, 0.0);
        let rig = DummyRig::new(layout);
        let mut t = open(&rig).await;
        assert_eq!(t.command("MG_LFA").await.unwrap(), "0.0000");
        assert_eq!(t.command("MG_LRA").await.unwrap(), "0.0000");

        // Forward is blocked by the shared sensor unless both inputs are disabled
        t.command("SH").await.unwrap();
        t.command("LDA=2").await.unwrap();
        t.command("PRA=4385").await.unwrap();
        assert!(t.command("BGA").await.is_err());
        t.command("LDA=3").await.unwrap();
        t.command("BGA").await.unwrap();
        assert_eq!(run_until_stopped(&mut t, 'A').await, "1.0000");
        assert_eq!(t.command("MG_LFA").await.unwrap(), "1.0000");
    }

    #[tokio::test]
    async fn stop_and_motor_off() {
        let rig = DummyRig::default();
        let mut t = open(&rig).await;
        assert!(t.command("BGA").await.is_err(), "motors are off after power-up");

        t.command("SH").await.unwrap();
        t.command("JGB=-500").await.unwrap();
        t.command("BGB").await.unwrap();
        t.command("MG_SCB").await.unwrap();
        t.command("ST").await.unwrap();
        assert_eq!(t.command("MG_SCB").await.unwrap(), "4.0000");
        assert_eq!(t.command("MG_SCC").await.unwrap(), "4.0000");

        t.command("MO").await.unwrap();
        assert!(!rig.motors_on());
    }

    #[tokio::test]
    async fn faults_clear_on_servo_here_unless_sticky() {
        let rig = DummyRig::default();
        let mut t = open(&rig).await;
        rig.inject_fault(ErrorKind::OverVoltageOrCurrent);
        rig.inject_sticky_fault(ErrorKind::EmergencyStopLatched);
        assert_eq!(t.command("MG_TA0").await.unwrap(), "1.0000");
        assert_eq!(t.command("MG_TA3").await.unwrap(), "1.0000");

        t.command("SH").await.unwrap();
        assert_eq!(t.command("MG_TA0").await.unwrap(), "0.0000");
        assert_eq!(t.command("MG_TA3").await.unwrap(), "1.0000");

        rig.clear_faults();
        assert_eq!(t.command("MG_TA3").await.unwrap(), "0.0000");
    }

    #[tokio::test]
    async fn link_loss_and_open_failures() {
        let rig = DummyRig::default();
        let mut t = rig.transport();
        let endpoint: Endpoint = "10.0.0.2".parse().unwrap();

        assert!(matches!(t.command("MO").await, Err(CommError::NotConnected)));

        rig.fail_next_open("refused");
        assert!(matches!(t.open(&endpoint).await, Err(CommError::Open { .. })));
        t.open(&endpoint).await.unwrap();
        assert_eq!(rig.endpoint(), Some(endpoint));

        rig.drop_link();
        assert!(matches!(t.command("MO").await, Err(CommError::Io(_))));
        rig.restore_link();
        assert!(t.command("MO").await.is_ok());
    }

    #[tokio::test]
    async fn injected_stop_code_replaces_limit_code_once() {
        let rig = DummyRig::default();
        let mut t = open(&rig).await;
        t.command("SH").await.unwrap();
        rig.inject_stop_code(Axis::Vertical, 99);

        t.command("JGD=1000").await.unwrap();
        t.command("BGD").await.unwrap();
        assert_eq!(run_until_stopped(&mut t, 'D').await, "99.0000");
        assert_eq!(rig.physical_position_cm(Axis::Vertical), 0.0);

        t.command("JGD=-1000").await.unwrap();
        t.command("BGD").await.unwrap();
        assert_eq!(run_until_stopped(&mut t, 'D').await, "3.0000");
    }

    #[tokio::test]
    async fn command_log_is_bounded() {
        let rig = DummyRig::default();
        let mut t = open(&rig).await;
        let total = COMMAND_LOG_CAPACITY + 10;
        for _ in 0..total {
            t.command("MG_TDA").await.unwrap();
        }
        t.command("MO").await.unwrap();

        assert_eq!(rig.log_len(), total + 1);
        assert_eq!(rig.commands().len(), COMMAND_LOG_CAPACITY);
        assert_eq!(rig.commands_since(total), vec!["MO"]);
        assert!(rig.commands_since(0).len() == COMMAND_LOG_CAPACITY);
    }

    #[tokio::test]
    async fn unknown_commands_are_rejected() {
        let rig = DummyRig::default();
        let mut t = open(&rig).await;
        assert!(matches!(
            t.command("XQ#AUTO").await,
            Err(CommError::Rejected { .. })
        ));
        assert_eq!(t.command("TC1").await.unwrap(), "1 Unrecognized command");
    }
}
