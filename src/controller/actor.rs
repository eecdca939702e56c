//! Background motion loop.
//!
//! The actor owns the controller link and every piece of mutable rig state. Each
//! iteration takes at most one request off the queue (waiting no longer than the
//! poll interval), applies it, re-reads telemetry when connected and publishes a
//! fresh [`RigSnapshot`].

use super::fault::RigFault;
use super::request::{Envelope, Request};
use super::status::{
    AxisTelemetry, Direction, LimitState, PerAxisTelemetry, RigSnapshot, Status, StopCode,
};
use crate::adapters::Endpoint;
use crate::axis::{Axis, AxisModel, Channel, PerAxisSpeed};
use crate::config::{MotionConfig, TimingConfig};
use crate::error::ConnectError;
use crate::protocol::{Command, ControllerLink, LimitDisable, LimitFlags};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

const MOTOR_TYPE: f64 = -2.5;
const AMPLIFIER_GAIN: u8 = 2;
const SLAVE_GEAR_RATIO: i64 = -1;

/// Sole owner of the controller link and rig state.
pub(crate) struct RigActor {
    pub(super) link: ControllerLink,
    pub(super) model: AxisModel,
    pub(super) motion: MotionConfig,
    pub(super) timing: TimingConfig,
    pub(super) shared: Arc<RwLock<RigSnapshot>>,
    pub(super) status: Status,
    pub(super) telemetry: PerAxisTelemetry,
    pub(super) position_known: bool,
    pub(super) speed: PerAxisSpeed,
    pub(super) speed_cm_s: f64,
    pub(super) endpoint: Option<Endpoint>,
    pub(super) connect_error: Option<String>,
    pub(super) processed_seq: u64,
    pub(super) settled_seq: u64,
    pub(super) motion_seq: Option<u64>,
    completions: Vec<(u64, oneshot::Sender<bool>)>,
}

impl RigActor {
    pub(crate) fn new(
        link: ControllerLink,
        motion: MotionConfig,
        timing: TimingConfig,
        shared: Arc<RwLock<RigSnapshot>>,
    ) -> Self {
        let model = AxisModel::new(&motion);
        Self {
            link,
            speed: model.min_speed(),
            speed_cm_s: motion.min_speed,
            model,
            motion,
            timing,
            shared,
            status: Status::Disconnected,
            telemetry: PerAxisTelemetry::default(),
            position_known: false,
            endpoint: None,
            connect_error: None,
            processed_seq: 0,
            settled_seq: 0,
            motion_seq: None,
            completions: Vec::new(),
        }
    }

    /// Run until every request sender has been dropped.
    pub(crate) async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Envelope>) {
        info!("Motion thread started");
        self.publish();

        loop {
            let before = self.status;
            match tokio::time::timeout(self.timing.poll_interval, requests.recv()).await {
                Ok(Some(envelope)) => self.process(envelope).await,
                Ok(None) => break,
                Err(_) => {}
            }
            self.note_transition(before);

            let before = self.status;
            if self.status.is_connected() {
                if let Err(fault) = self.poll().await {
                    self.escalate(fault).await;
                }
            }
            self.note_transition(before);
            self.publish();
            self.resolve_completions();
        }

        if self.status.is_connected() {
            info!("Request queue closed, shutting down controller link");
            // Stop first; teardown powers down and closes
            if let Err(e) = self.link.execute(&Command::Stop).await {
                warn!(error = %e, "Stop failed during shutdown");
            }
            self.teardown().await;
        }
        self.publish();
        self.resolve_completions();
        info!("Motion thread stopped");
    }

    fn note_transition(&self, before: Status) {
        if self.status != before {
            info!("status change {} > {}", before, self.status);
        }
    }

    /// Copy local state into the shared snapshot. Errors are written in place elsewhere.
    pub(super) fn publish(&self) {
        let mut snapshot = self.shared.write();
        snapshot.status = self.status;
        snapshot.telemetry = self.telemetry;
        snapshot.position_known = self.position_known;
        snapshot.connect_error = self.connect_error.clone();
        snapshot.endpoint = self.endpoint.as_ref().map(ToString::to_string);
        snapshot.speed_cm_s = self.speed_cm_s;
        snapshot.processed_seq = self.processed_seq;
        snapshot.settled_seq = self.settled_seq;
        snapshot.motion_seq = self.motion_seq;
    }

    async fn process(&mut self, envelope: Envelope) {
        let Envelope { seq, request, done } = envelope;
        self.processed_seq = seq;
        debug!(seq, request = request.name(), status = %self.status, "Processing request");

        let result = match request {
            Request::Connect { endpoint } => {
                self.handle_connect(endpoint).await;
                Ok(())
            }
            Request::Disconnect => {
                self.handle_disconnect().await;
                Ok(())
            }
            Request::SetSpeed { cm_s, speed } => {
                self.speed = speed;
                self.speed_cm_s = cm_s;
                debug!(cm_s, "Speed set");
                Ok(())
            }
            _ if !self.status.is_connected() => {
                debug!(request = request.name(), "Ignored while disconnected");
                Ok(())
            }
            Request::EnableStop => self.handle_stop().await,
            Request::DisableMotors => self.handle_disable_motors().await,
            Request::Jog { axis, forward } => self.handle_jog(seq, axis, forward).await,
            Request::MoveRelative { delta } => {
                match self.model.checked_counts("displacement", delta) {
                    Ok(counts) => self.start_move(seq, counts, MoveKind::Relative).await,
                    Err(e) => {
                        warn!(error = %e, "Move ignored");
                        Ok(())
                    }
                }
            }
            Request::MoveAbsolute { target } => match self.model.checked_counts("position", target) {
                Ok(counts) => self.start_move(seq, counts, MoveKind::Absolute).await,
                Err(e) => {
                    warn!(error = %e, "Move ignored");
                    Ok(())
                }
            },
            Request::Home => self.home(seq).await,
        };

        if let Err(fault) = result {
            self.escalate(fault).await;
        }

        if let Some(done) = done {
            self.completions.push((seq, done));
        }
    }

    /// Answer every waiter whose motion is no longer in progress.
    ///
    /// Runs after [`RigActor::publish`] so a waiter that wakes up reads a
    /// snapshot that already reflects the outcome.
    fn resolve_completions(&mut self) {
        let in_progress = self.motion_seq;
        let (waiting, finished): (Vec<_>, Vec<_>) = std::mem::take(&mut self.completions)
            .into_iter()
            .partition(|(seq, _)| in_progress == Some(*seq));
        self.completions = waiting;

        for (seq, done) in finished {
            let settled = self.settled_seq == seq;
            debug!(seq, settled, "Motion finished");
            // The waiter may have timed out already
            let _ = done.send(settled);
        }
    }

    #[instrument(skip(self))]
    async fn handle_connect(&mut self, endpoint: Endpoint) {
        if self.status.is_connected() {
            debug!("Already connected");
            return;
        }

        self.shared.write().errors.clear();
        self.connect_error = None;

        match self.bring_up(&endpoint).await {
            Ok(()) => {
                info!("Controller ready");
                self.status = Status::MotorsDisabled;
                self.endpoint = Some(endpoint);
                self.telemetry = PerAxisTelemetry::default();
                self.position_known = false;
                self.motion_seq = None;
            }
            Err(e) => {
                warn!(error = %e, "Connect failed");
                {
                    let mut snapshot = self.shared.write();
                    for kind in e.error_kinds() {
                        snapshot.errors.insert(kind, e.to_string());
                    }
                }
                self.connect_error = Some(e.to_string());
                self.teardown().await;
            }
        }
    }

    async fn bring_up(&mut self, endpoint: &Endpoint) -> Result<(), ConnectError> {
        self.link.open(endpoint).await?;
        self.link.execute(&Command::Reset).await?;
        tokio::time::sleep(self.timing.settle_time).await;
        if endpoint.is_serial() {
            self.link.execute(&Command::EchoOff).await?;
        }

        let faults = self.link.faults().await?;
        if !faults.is_empty() {
            self.begin_fault_clear(&faults).await?;
        }

        self.link.execute(&Command::MotorType(MOTOR_TYPE)).await?;
        self.link
            .execute(&Command::AmplifierGain(AMPLIFIER_GAIN))
            .await?;
        let master = Axis::Transverse.channel();
        if let Some(slave) = Axis::Transverse.slave() {
            self.link.execute(&Command::Gang { slave, master }).await?;
            self.link
                .execute(&Command::GearRatio(slave, SLAVE_GEAR_RATIO))
                .await?;
            self.link.execute(&Command::GantryMode(slave, true)).await?;
        }
        self.speed = self.model.min_speed();
        self.speed_cm_s = self.motion.min_speed;

        if !faults.is_empty() {
            self.finish_fault_clear().await?;
        }
        Ok(())
    }

    async fn handle_disconnect(&mut self) {
        if !self.status.is_connected() {
            return;
        }
        info!("Disconnecting");
        if let Err(e) = self.link.execute(&Command::Stop).await {
            warn!(error = %e, "Stop failed while disconnecting");
        }
        self.teardown().await;
    }

    async fn handle_stop(&mut self) -> Result<(), RigFault> {
        match self.status {
            // Homing runs to completion inside its own request, so it is never current here
            Status::Stopped | Status::MotorsDisabled | Status::Disconnected | Status::Homing => {}
            Status::Jogging | Status::MovingRelative | Status::MovingAbsolute => {
                self.link.execute(&Command::Stop).await?;
                for t in &mut self.telemetry {
                    t.movement_direction = Direction::None;
                }
                self.update_limits().await?;
                self.motion_seq = None;
                self.status = Status::Stopped;
            }
        }
        Ok(())
    }

    async fn handle_disable_motors(&mut self) -> Result<(), RigFault> {
        self.link.execute(&Command::Stop).await?;
        self.link.execute(&Command::MotorsOff).await?;
        self.power_down();
        Ok(())
    }

    fn power_down(&mut self) {
        self.status = Status::MotorsDisabled;
        self.position_known = false;
        self.motion_seq = None;
        for t in &mut self.telemetry {
            t.movement_direction = Direction::None;
        }
    }

    #[instrument(skip(self), err)]
    async fn handle_jog(&mut self, seq: u64, axis: Axis, forward: bool) -> Result<(), RigFault> {
        if self.status != Status::Stopped || !self.position_known {
            debug!(status = %self.status, "Jog ignored");
            return Ok(());
        }
        let direction = Direction::from_forward(forward);
        if self.telemetry[axis.index()].limit_state.blocks(direction) {
            warn!("Jog into active limit refused");
            return Ok(());
        }

        for t in &mut self.telemetry {
            t.movement_direction = Direction::None;
        }
        self.telemetry[axis.index()].movement_direction = direction;
        self.configure_limits().await?;

        let channel = axis.channel();
        let speed = direction.sign() * self.speed.get(axis);
        self.link.execute(&Command::Jog(channel, speed)).await?;
        self.link.execute(&Command::Begin(vec![channel])).await?;

        self.status = Status::Jogging;
        self.motion_seq = Some(seq);
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn start_move(
        &mut self,
        seq: u64,
        counts: [i64; 3],
        kind: MoveKind,
    ) -> Result<(), RigFault> {
        if self.status != Status::Stopped || !self.position_known {
            debug!(status = %self.status, "Move ignored");
            return Ok(());
        }

        let delta = match kind {
            MoveKind::Relative => counts,
            MoveKind::Absolute => {
                Axis::ALL.map(|a| {
                    counts[a.index()].saturating_sub(self.telemetry[a.index()].position_counts)
                })
            }
        };
        let directions = delta.map(Direction::of_delta);

        // All axes are checked before anything is sent
        if let Some(axis) = Axis::ALL
            .into_iter()
            .find(|a| self.telemetry[a.index()].limit_state.blocks(directions[a.index()]))
        {
            warn!(%axis, "Move into active limit refused");
            return Ok(());
        }

        let moving: Vec<Axis> = Axis::ALL
            .into_iter()
            .filter(|a| delta[a.index()] != 0)
            .collect();
        if moving.is_empty() {
            debug!("Already at target");
            self.settled_seq = seq;
            return Ok(());
        }

        for axis in Axis::ALL {
            self.telemetry[axis.index()].movement_direction = directions[axis.index()];
        }
        for axis in &moving {
            let channel = axis.channel();
            self.link
                .execute(&Command::Speed(channel, self.speed.get(*axis)))
                .await?;
            let target = match kind {
                MoveKind::Relative => Command::PositionRelative(channel, counts[axis.index()]),
                MoveKind::Absolute => Command::PositionAbsolute(channel, counts[axis.index()]),
            };
            self.link.execute(&target).await?;
        }
        self.configure_limits().await?;
        let channels = moving.iter().map(|a| a.channel()).collect();
        self.link.execute(&Command::Begin(channels)).await?;

        self.status = match kind {
            MoveKind::Relative => Status::MovingRelative,
            MoveKind::Absolute => Status::MovingAbsolute,
        };
        self.motion_seq = Some(seq);
        Ok(())
    }

    /// One telemetry cycle: position, stop codes, limits, completion, fault flags.
    async fn poll(&mut self) -> Result<(), RigFault> {
        for axis in Axis::ALL {
            let channel = axis.channel();
            let t = &mut self.telemetry[axis.index()];
            t.position_counts = self.link.position(channel).await?;
            t.stop_code = self.link.stop_code(channel).await?;
        }
        self.update_limits().await?;

        if self.status.is_moving() && !self.telemetry.iter().any(|t| t.stop_code.is_running()) {
            self.conclude_motion()?;
        }

        let faults = self.link.faults().await?;
        if !faults.is_empty() {
            return Err(RigFault::Hardware(faults));
        }
        Ok(())
    }

    fn conclude_motion(&mut self) -> Result<(), RigFault> {
        for axis in Axis::ALL {
            let t = &mut self.telemetry[axis.index()];
            match t.stop_code {
                StopCode::DecelStopFwdLim => t.limit_state = LimitState::AtPositive,
                StopCode::DecelStopRevLim => t.limit_state = LimitState::AtNegative,
                StopCode::DecelStopSt | StopCode::DecelStopIndependent => {
                    if t.movement_direction != Direction::None {
                        t.limit_state = LimitState::Clear;
                    }
                }
                code => return Err(RigFault::UnexpectedStop { axis, code }),
            }
            t.movement_direction = Direction::None;
        }
        debug!(limits = ?self.telemetry.map(|t| t.limit_state), "Motion complete");
        self.status = Status::Stopped;
        if let Some(seq) = self.motion_seq.take() {
            self.settled_seq = seq;
        }
        Ok(())
    }

    /// Re-derive limit states from the limit inputs and software bounds,
    /// reprogramming the controller when any state changed.
    pub(super) async fn update_limits(&mut self) -> Result<(), RigFault> {
        let mut next = self.telemetry.map(|t| t.limit_state);
        for axis in Axis::ALL {
            let flags = self.link.limit_flags(axis.channel()).await?;
            next[axis.index()] = classify_limit(axis, flags, next[axis.index()])?;
        }

        if self.position_known {
            let floor = self.model.to_counts(Axis::Vertical, self.motion.vertical_floor);
            if self.telemetry[Axis::Vertical.index()].position_counts <= floor {
                next[Axis::Vertical.index()] = LimitState::AtNegative;
            }
            let ceiling = self
                .model
                .to_counts(Axis::Transverse, self.motion.transverse_ceiling);
            if self.telemetry[Axis::Transverse.index()].position_counts >= ceiling {
                next[Axis::Transverse.index()] = LimitState::AtPositive;
            }
        }

        if next != self.telemetry.map(|t| t.limit_state) {
            debug!(limits = ?next, "Limit state changed");
            for axis in Axis::ALL {
                self.telemetry[axis.index()].limit_state = next[axis.index()];
            }
            self.configure_limits().await?;
        }
        Ok(())
    }

    /// Program limit-switch enablement and software limits for the current
    /// limit states and directions of motion.
    pub(super) async fn configure_limits(&mut self) -> Result<(), RigFault> {
        for axis in Axis::ALL {
            let AxisTelemetry {
                limit_state,
                movement_direction,
                ..
            } = self.telemetry[axis.index()];
            let mode = limit_disable_for(axis, limit_state, movement_direction);
            self.link
                .execute(&Command::LimitDisable(axis.channel(), mode))
                .await?;
        }
        let floor = self.model.to_counts(Axis::Vertical, self.motion.vertical_floor);
        self.link
            .execute(&Command::BackLimit(Axis::Vertical.channel(), floor))
            .await?;
        let ceiling = self
            .model
            .to_counts(Axis::Transverse, self.motion.transverse_ceiling);
        self.link
            .execute(&Command::ForwardLimit(Axis::Transverse.channel(), ceiling))
            .await?;
        Ok(())
    }

    /// Channels driven by the given axes.
    pub(super) fn channels(axes: &[Axis]) -> Vec<Channel> {
        axes.iter().map(|a| a.channel()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum MoveKind {
    Relative,
    Absolute,
}

/// Limit state implied by an axis's limit inputs.
///
/// The shared lateral sensor cannot tell which end it is at, so it only ever
/// clears a state; dedicated switches map directly.
pub(crate) fn classify_limit(
    axis: Axis,
    flags: LimitFlags,
    current: LimitState,
) -> Result<LimitState, RigFault> {
    if axis.has_shared_limit_sensor() {
        return Ok(if flags.forward { current } else { LimitState::Clear });
    }
    match (flags.forward, flags.reverse) {
        (true, false) => Ok(LimitState::AtPositive),
        (false, true) => Ok(LimitState::AtNegative),
        (false, false) => Ok(LimitState::Clear),
        (true, true) => Err(RigFault::LimitSensor { axis }),
    }
}

/// Switch enablement for one axis.
///
/// On the shared sensor both inputs are disabled while departing a recorded
/// limit; otherwise only the input opposing the motion is disabled, the forward
/// one when idle. Dedicated switches stay enabled.
pub(crate) fn limit_disable_for(
    axis: Axis,
    limit: LimitState,
    direction: Direction,
) -> LimitDisable {
    if !axis.has_shared_limit_sensor() {
        return LimitDisable::None;
    }
    match (limit, direction) {
        (LimitState::AtNegative | LimitState::AtPositive, Direction::Forward | Direction::Backward) => {
            LimitDisable::Both
        }
        (_, Direction::Forward) => LimitDisable::Reverse,
        _ => LimitDisable::Forward,
    }
}
