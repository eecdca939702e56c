//! Controller fault detection and recovery.
//!
//! Faults found by the motion thread never cross the thread boundary as `Err`.
//! They become [`RigFault`] values, are written into the shared
//! [`ErrorSet`](super::ErrorSet) and force the rig to `Disconnected`.

use super::actor::RigActor;
use super::status::{ErrorKind, ErrorSet, Status, StopCode};
use crate::axis::Axis;
use crate::error::{CommError, ConnectError};
use crate::protocol::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Unrecoverable failure detected inside the motion thread.
#[derive(Error, Debug)]
pub(crate) enum RigFault {
    #[error(transparent)]
    Comm(#[from] CommError),

    #[error("Controller fault flags set: {0:?}")]
    Hardware(Vec<ErrorKind>),

    #[error("Unexpected stop code {code} on {axis} axis")]
    UnexpectedStop { axis: Axis, code: StopCode },

    #[error("Both limit inputs active on {axis} axis")]
    LimitSensor { axis: Axis },

    #[error("Homing failed on {axis} axis: expected {expected}, got {actual}")]
    HomingFailed {
        axis: Axis,
        expected: StopCode,
        actual: StopCode,
    },

    #[error("Homing motion did not complete within {0:?}")]
    HomingTimeout(Duration),
}

impl RigFault {
    /// Write this fault into an error set.
    pub(crate) fn record(&self, errors: &mut ErrorSet) {
        match self {
            RigFault::Comm(e) => errors.insert(ErrorKind::CommunicationFault, e.to_string()),
            RigFault::Hardware(kinds) => {
                for kind in kinds {
                    errors.insert(*kind, kind.description());
                }
            }
            other => errors.insert(ErrorKind::Other, other.to_string()),
        }
    }
}

impl RigActor {
    /// Clear latched controller faults during connect.
    ///
    /// The first half (motors off, wait) runs before the motors are configured,
    /// the second half (servo here, motors off, re-probe) after.
    pub(super) async fn begin_fault_clear(&mut self, faults: &[ErrorKind]) -> Result<(), CommError> {
        warn!(?faults, "Controller reports faults on connect, clearing");
        self.link.execute(&Command::MotorsOff).await?;
        tokio::time::sleep(self.timing.fault_clear_wait).await;
        Ok(())
    }

    pub(super) async fn finish_fault_clear(&mut self) -> Result<(), ConnectError> {
        self.link.execute(&Command::ServoHere).await?;
        self.link.execute(&Command::MotorsOff).await?;
        let remaining = self.link.faults().await?;
        if remaining.is_empty() {
            tracing::info!("Controller faults cleared");
            Ok(())
        } else {
            Err(ConnectError::FaultClearFailed(remaining))
        }
    }

    /// Record a fault, power down best-effort and drop the link.
    pub(super) async fn escalate(&mut self, fault: RigFault) {
        error!(error = %fault, status = %self.status, "Unrecoverable rig fault, disconnecting");
        fault.record(&mut self.shared.write().errors);
        self.teardown().await;
    }

    /// Best-effort motor disable and close; always ends `Disconnected`.
    pub(super) async fn teardown(&mut self) {
        if let Err(e) = self.link.execute(&Command::MotorsOff).await {
            warn!(error = %e, "Motor disable failed during teardown");
        }
        if let Err(e) = self.link.close().await {
            warn!(error = %e, "Closing controller link failed");
        }
        self.status = Status::Disconnected;
        self.position_known = false;
        self.motion_seq = None;
        self.endpoint = None;
    }
}
