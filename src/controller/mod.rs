//! Motion controller: caller-facing handle and background motion thread.
//!
//! [`MotionController`] never blocks on hardware. Every operation validates its
//! input, tags a [`Request`] with a sequence number and queues it for the motion
//! thread, which owns the controller link and publishes a [`RigSnapshot`] after
//! every loop iteration. Reads take a short lock on that snapshot.
//!
//! ```no_run
//! use nearfield_rig::config::RigConfig;
//! use nearfield_rig::controller::{MotionController, Status};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = RigConfig::load()?;
//! let rig = MotionController::from_config(&config)?;
//! rig.connect(&config.connection.endpoint)?;
//! rig.home()?;
//! while rig.status() != Status::Stopped {
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! if !rig.move_absolute_blocking([5.0, 5.0, -2.0], std::time::Duration::from_secs(60)) {
//!     eprintln!("move did not settle: {:?}", rig.errors());
//! }
//! # Ok(())
//! # }
//! ```

mod actor;
mod fault;
mod homing;
pub mod request;
pub mod status;

pub use request::Request;
pub use status::{
    AxisTelemetry, Direction, ErrorKind, ErrorSet, LimitState, PerAxisTelemetry, RigSnapshot,
    Status, StopCode,
};

use crate::adapters::{transport_from_config, Endpoint, SharedTransport, Transport};
use crate::axis::{Axis, AxisModel};
use crate::config::{RigConfig, TimingConfig};
use crate::error::{RigError, RigResult};
use crate::protocol::ControllerLink;
use actor::RigActor;
use parking_lot::{Mutex, RwLock};
use request::Envelope;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

struct Queue {
    sender: Option<mpsc::UnboundedSender<Envelope>>,
    next_seq: u64,
}

/// Handle on the rig's motion controller.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Dropping the handle
/// stops the motion thread, which first stops and powers down a connected rig.
pub struct MotionController {
    queue: Mutex<Queue>,
    shared: Arc<RwLock<RigSnapshot>>,
    model: AxisModel,
    timing: TimingConfig,
    tcp_port: u16,
    thread: Option<JoinHandle<()>>,
}

impl MotionController {
    /// Start the motion thread over the transport selected in `config`.
    pub fn from_config(config: &RigConfig) -> RigResult<Self> {
        Self::spawn(config, transport_from_config(&config.connection))
    }

    /// Start the motion thread over an explicit transport.
    pub fn spawn(config: &RigConfig, transport: Box<dyn Transport>) -> RigResult<Self> {
        let shared = Arc::new(RwLock::new(RigSnapshot {
            speed_cm_s: config.motion.min_speed,
            ..RigSnapshot::default()
        }));
        let (sender, receiver) = mpsc::unbounded_channel();
        let link = ControllerLink::new(SharedTransport::new(transport));
        let actor = RigActor::new(
            link,
            config.motion.clone(),
            config.timing.clone(),
            Arc::clone(&shared),
        );

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RigError::Spawn)?;
        let thread = std::thread::Builder::new()
            .name("motion-controller".to_string())
            .spawn(move || runtime.block_on(actor.run(receiver)))
            .map_err(RigError::Spawn)?;

        Ok(Self {
            queue: Mutex::new(Queue {
                sender: Some(sender),
                next_seq: 0,
            }),
            shared,
            model: AxisModel::new(&config.motion),
            timing: config.timing.clone(),
            tcp_port: config.connection.tcp_port,
            thread: Some(thread),
        })
    }

    fn send(&self, request: Request) -> RigResult<u64> {
        self.enqueue(request, None)
    }

    fn enqueue(&self, request: Request, done: Option<oneshot::Sender<bool>>) -> RigResult<u64> {
        let mut queue = self.queue.lock();
        let seq = queue.next_seq + 1;
        let sender = queue.sender.as_ref().ok_or(RigError::ControllerGone)?;
        debug!(seq, request = request.name(), "Queueing request");
        sender
            .send(Envelope { seq, request, done })
            .map_err(|_| RigError::ControllerGone)?;
        queue.next_seq = seq;
        Ok(seq)
    }

    /// Connect to the controller at `endpoint` (`COM4`, `/dev/ttyUSB0`, `host` or `host:port`).
    ///
    /// Returns once the request is queued. Connection failures are reported
    /// through [`MotionController::errors`] and [`RigSnapshot::connect_error`].
    pub fn connect(&self, endpoint: &str) -> RigResult<()> {
        let endpoint = Endpoint::parse_with_port(endpoint, self.tcp_port)?;
        self.send(Request::Connect { endpoint }).map(drop)
    }

    /// Stop, power down and close the link.
    pub fn disconnect(&self) -> RigResult<()> {
        self.send(Request::Disconnect).map(drop)
    }

    /// Jog one axis until stopped or a limit is reached.
    pub fn jog(&self, axis: Axis, forward: bool) -> RigResult<()> {
        self.send(Request::Jog { axis, forward }).map(drop)
    }

    /// Run the homing sequence.
    pub fn home(&self) -> RigResult<()> {
        self.send(Request::Home).map(drop)
    }

    /// Stop motion, keeping the motors powered.
    ///
    /// Queued behind any homing run already in progress.
    pub fn stop(&self) -> RigResult<()> {
        self.send(Request::EnableStop).map(drop)
    }

    /// Stop and power down every motor.
    pub fn disable_motors(&self) -> RigResult<()> {
        self.send(Request::DisableMotors).map(drop)
    }

    /// Move by `delta` centimetres (lateral, transverse, vertical).
    ///
    /// Non-finite components and displacements beyond the controller's counter
    /// range are rejected with [`OutOfRange`](crate::error::OutOfRange).
    pub fn move_relative(&self, delta: [f64; 3]) -> RigResult<()> {
        self.model.checked_counts("displacement", delta)?;
        self.send(Request::MoveRelative { delta }).map(drop)
    }

    /// Move to `target` centimetres from the homed origin.
    ///
    /// Non-finite components and targets beyond the controller's counter range
    /// are rejected with [`OutOfRange`](crate::error::OutOfRange).
    pub fn move_absolute(&self, target: [f64; 3]) -> RigResult<()> {
        self.model.checked_counts("position", target)?;
        self.send(Request::MoveAbsolute { target }).map(drop)
    }

    /// Set the stage speed for later moves and jogs.
    ///
    /// Out-of-envelope speeds are rejected here and never reach the motion thread.
    pub fn set_speed(&self, cm_s: f64) -> RigResult<()> {
        let speed = self.model.set_speed(cm_s)?;
        self.send(Request::SetSpeed { cm_s, speed }).map(drop)
    }

    /// Move to `target` and wait on the calling thread until the move settles.
    ///
    /// Returns `true` only if this move concluded with the rig `Stopped`; `false`
    /// for an invalid target, on timeout, disconnection or if the move was refused
    /// or interrupted. The outcome is tracked for this request alone, so later
    /// requests settling first cannot be mistaken for it.
    pub fn move_absolute_blocking(&self, target: [f64; 3], timeout: Duration) -> bool {
        if let Err(e) = self.model.checked_counts("position", target) {
            warn!(error = %e, "Blocking move rejected");
            return false;
        }
        let (done, mut outcome) = oneshot::channel();
        let seq = match self.enqueue(Request::MoveAbsolute { target }, Some(done)) {
            Ok(seq) => seq,
            Err(e) => {
                warn!(error = %e, "Blocking move not queued");
                return false;
            }
        };
        let deadline = Instant::now() + timeout;

        loop {
            match outcome.try_recv() {
                Ok(true) => return true,
                Ok(false) | Err(oneshot::error::TryRecvError::Closed) => {
                    debug!(seq, status = %self.status(), "Blocking move refused or interrupted");
                    return false;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            if Instant::now() >= deadline {
                warn!(seq, ?target, "Blocking move timed out");
                return false;
            }
            std::thread::sleep(self.timing.blocking_poll_interval);
        }
    }

    /// Current rig status.
    pub fn status(&self) -> Status {
        self.shared.read().status
    }

    /// Position in centimetres; `None` until homed or while motors are off.
    pub fn position_cm(&self) -> Option<[f64; 3]> {
        self.shared.read().position_cm(&self.model)
    }

    /// Position in controller counts; `None` under the same conditions as [`Self::position_cm`].
    pub fn position_counts(&self) -> Option<[i64; 3]> {
        self.shared.read().position_counts()
    }

    /// Last polled per-axis telemetry.
    pub fn telemetry(&self) -> PerAxisTelemetry {
        self.shared.read().telemetry
    }

    /// Faults recorded since the last connect or [`Self::clear_errors`].
    pub fn errors(&self) -> ErrorSet {
        self.shared.read().errors.clone()
    }

    /// Forget recorded faults.
    pub fn clear_errors(&self) {
        self.shared.write().errors.clear();
    }

    /// Consistent copy of everything the motion thread publishes.
    pub fn snapshot(&self) -> RigSnapshot {
        self.shared.read().clone()
    }

    /// Unit conversions used by this controller.
    pub fn model(&self) -> &AxisModel {
        &self.model
    }

    /// Stop the motion thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        // Dropping the sender ends the motion loop
        self.queue.lock().sender = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Motion thread panicked");
            } else {
                info!("Motion controller shut down");
            }
        }
    }
}

impl Drop for MotionController {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MotionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.shared.read();
        f.debug_struct("MotionController")
            .field("status", &snapshot.status)
            .field("endpoint", &snapshot.endpoint)
            .field("running", &self.thread.is_some())
            .finish()
    }
}
