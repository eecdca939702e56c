//! Spatial sweeps over a 3-D grid of stage positions.
//!
//! A [`SpatialSweep`] enumerates grid points lateral-fastest, then transverse,
//! then vertical. The lateral direction alternates on every other transverse row
//! so the stage never flies back across a whole row between measurements.
//! [`run_sweep`] drives a [`MotionController`] through the points, settling at
//! each one before handing the position to a measurement callback.

use crate::axis::Axis;
use crate::controller::MotionController;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument};

/// Errors raised while building or running a sweep.
#[derive(Error, Debug)]
pub enum SweepError {
    /// A range was given with zero points.
    #[error("Sweep range for the {axis} axis has no points")]
    EmptyRange {
        /// Offending axis
        axis: Axis,
    },

    /// A range string could not be parsed.
    #[error("Invalid sweep range '{0}', expected start,stop,points")]
    InvalidRange(String),

    /// The stage did not settle at a sweep point; the motors have been disabled.
    #[error("Move to point {index} {target:?} did not complete")]
    MoveFailed {
        /// Index of the point in sweep order
        index: usize,
        /// Target position in centimetres
        target: [f64; 3],
    },

    /// The measurement callback asked the sweep to stop.
    #[error("Measurement at point {index} failed: {reason:#}")]
    Measurement {
        /// Index of the point in sweep order
        index: usize,
        /// Error returned by the callback
        reason: anyhow::Error,
    },
}

/// Evenly spaced positions along one axis, both ends included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    /// First position in centimetres
    pub start: f64,
    /// Last position in centimetres
    pub stop: f64,
    /// Number of positions
    pub points: usize,
}

impl SweepRange {
    /// Range from `start` to `stop` with `points` positions.
    pub fn new(start: f64, stop: f64, points: usize) -> Self {
        Self {
            start,
            stop,
            points,
        }
    }

    /// A single position.
    pub fn fixed(position: f64) -> Self {
        Self::new(position, position, 1)
    }

    /// Position at `index`.
    pub fn position(&self, index: usize) -> f64 {
        if self.points <= 1 {
            self.start
        } else {
            let step = (self.stop - self.start) / (self.points - 1) as f64;
            self.start + step * index as f64
        }
    }
}

impl FromStr for SweepRange {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SweepError::InvalidRange(s.to_string());
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [start, stop, points] = parts.as_slice() else {
            return Err(invalid());
        };
        Ok(Self::new(
            start.parse().map_err(|_| invalid())?,
            stop.parse().map_err(|_| invalid())?,
            points.parse().map_err(|_| invalid())?,
        ))
    }
}

/// Serpentine grid over all three axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialSweep {
    ranges: [SweepRange; 3],
}

impl SpatialSweep {
    /// Grid from one range per axis (lateral, transverse, vertical).
    pub fn new(ranges: [SweepRange; 3]) -> Result<Self, SweepError> {
        if let Some(axis) = Axis::ALL
            .into_iter()
            .find(|a| ranges[a.index()].points == 0)
        {
            return Err(SweepError::EmptyRange { axis });
        }
        Ok(Self { ranges })
    }

    /// Range of one axis.
    pub fn range(&self, axis: Axis) -> SweepRange {
        self.ranges[axis.index()]
    }

    /// Total number of points.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| r.points).product()
    }

    /// Always false; every range has at least one point.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Points in sweep order.
    pub fn points(&self) -> Vec<[f64; 3]> {
        let [lateral, transverse, vertical] = self.ranges;
        let mut points = Vec::with_capacity(self.len());
        for k in 0..vertical.points {
            for j in 0..transverse.points {
                for step in 0..lateral.points {
                    let i = if j % 2 == 1 {
                        lateral.points - 1 - step
                    } else {
                        step
                    };
                    points.push([
                        lateral.position(i),
                        transverse.position(j),
                        vertical.position(k),
                    ]);
                }
            }
        }
        points
    }
}

/// Drive the rig through every point of `sweep`, calling `measure` at each.
///
/// The rig must be homed and `Stopped`. Each move gets `move_timeout` to settle.
/// Returns the number of points measured.
#[instrument(skip(controller, measure), fields(points = sweep.len()), err)]
pub fn run_sweep<F>(
    controller: &MotionController,
    sweep: &SpatialSweep,
    move_timeout: Duration,
    mut measure: F,
) -> Result<usize, SweepError>
where
    F: FnMut(usize, [f64; 3]) -> anyhow::Result<()>,
{
    info!("Sweep started");
    for (index, target) in sweep.points().into_iter().enumerate() {
        if !controller.move_absolute_blocking(target, move_timeout) {
            error!(index, ?target, status = %controller.status(), "Sweep move failed");
            if let Err(e) = controller.disable_motors() {
                error!(error = %e, "Could not disable motors after failed sweep move");
            }
            return Err(SweepError::MoveFailed { index, target });
        }
        measure(index, target).map_err(|reason| SweepError::Measurement { index, reason })?;
    }
    info!("Sweep finished");
    Ok(sweep.len())
}
