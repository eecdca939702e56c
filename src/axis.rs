//! Axis/motor model.
//!
//! Three logical axes drive four controller channels:
//!
//! | Axis       | Channel | Slave | Limit sensor          | Homes toward |
//! |------------|---------|-------|-----------------------|--------------|
//! | Lateral    | A       |       | one shared sensor     | reverse      |
//! | Transverse | B       | C     | dedicated switches    | reverse      |
//! | Vertical   | D       |       | dedicated switches    | forward      |
//!
//! The transverse slave is geared to its master on the controller and is never
//! addressed on its own by motion commands.

use crate::config::MotionConfig;
use crate::error::OutOfRange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Channel A, shared forward/reverse sensor
    Lateral,
    /// Channel B with slave C
    Transverse,
    /// Channel D
    Vertical,
}

impl Axis {
    /// All axes in telemetry order.
    pub const ALL: [Axis; 3] = [Axis::Lateral, Axis::Transverse, Axis::Vertical];

    /// Index into per-axis arrays.
    pub fn index(self) -> usize {
        match self {
            Axis::Lateral => 0,
            Axis::Transverse => 1,
            Axis::Vertical => 2,
        }
    }

    /// Primary motor channel.
    pub fn channel(self) -> Channel {
        match self {
            Axis::Lateral => Channel::A,
            Axis::Transverse => Channel::B,
            Axis::Vertical => Channel::D,
        }
    }

    /// Channel geared to the primary, if any.
    pub fn slave(self) -> Option<Channel> {
        match self {
            Axis::Transverse => Some(Channel::C),
            _ => None,
        }
    }

    /// Whether one physical sensor serves as both forward and reverse limit.
    pub fn has_shared_limit_sensor(self) -> bool {
        matches!(self, Axis::Lateral)
    }

    /// Direction of travel toward the homing reference switch.
    pub fn homing_direction(self) -> Direction {
        match self {
            Axis::Lateral | Axis::Transverse => Direction::Backward,
            Axis::Vertical => Direction::Forward,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::Lateral => "lateral",
            Axis::Transverse => "transverse",
            Axis::Vertical => "vertical",
        };
        f.write_str(name)
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lateral" | "x" => Ok(Axis::Lateral),
            "transverse" | "y" => Ok(Axis::Transverse),
            "vertical" | "z" => Ok(Axis::Vertical),
            other => Err(format!(
                "Unknown axis '{}'. Expected lateral, transverse or vertical",
                other
            )),
        }
    }
}

/// Physical controller output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Lateral motor
    A,
    /// Transverse master
    B,
    /// Transverse slave
    C,
    /// Vertical motor
    D,
}

impl Channel {
    /// All channels in controller order.
    pub const ALL: [Channel; 4] = [Channel::A, Channel::B, Channel::C, Channel::D];

    /// Controller axis letter.
    pub fn letter(self) -> char {
        match self {
            Channel::A => 'A',
            Channel::B => 'B',
            Channel::C => 'C',
            Channel::D => 'D',
        }
    }

    /// Zero-based position in controller order.
    pub fn index(self) -> usize {
        match self {
            Channel::A => 0,
            Channel::B => 1,
            Channel::C => 2,
            Channel::D => 3,
        }
    }

    /// Channel for a controller axis letter.
    pub fn from_letter(letter: char) -> Option<Channel> {
        match letter.to_ascii_uppercase() {
            'A' => Some(Channel::A),
            'B' => Some(Channel::B),
            'C' => Some(Channel::C),
            'D' => Some(Channel::D),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Direction an axis is currently being driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Not commanded
    #[default]
    None,
    /// Increasing counts
    Forward,
    /// Decreasing counts
    Backward,
}

impl Direction {
    /// Direction of a signed displacement; zero maps to `None`.
    pub fn of_delta(delta: i64) -> Direction {
        match delta {
            d if d > 0 => Direction::Forward,
            d if d < 0 => Direction::Backward,
            _ => Direction::None,
        }
    }

    /// Direction for a jog request.
    pub fn from_forward(forward: bool) -> Direction {
        if forward {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    /// Reverse direction; `None` stays `None`.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
            Direction::None => Direction::None,
        }
    }

    /// +1, -1 or 0.
    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
            Direction::None => 0,
        }
    }
}

/// Speed per axis in controller counts per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerAxisSpeed(pub [i64; 3]);

impl PerAxisSpeed {
    /// Speed of one axis.
    pub fn get(&self, axis: Axis) -> i64 {
        self.0[axis.index()]
    }
}

/// Unit conversion and speed envelope for the three axes.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisModel {
    counts_per_cm: [f64; 3],
    vertical_speed_factor: f64,
    min_speed: f64,
    max_speed: f64,
}

impl AxisModel {
    /// Build from the `[motion]` configuration section.
    pub fn new(config: &MotionConfig) -> Self {
        Self {
            counts_per_cm: config.counts_per_cm,
            vertical_speed_factor: config.vertical_speed_factor,
            min_speed: config.min_speed,
            max_speed: config.max_speed,
        }
    }

    /// Encoder counts per centimetre of one axis.
    pub fn counts_per_cm(&self, axis: Axis) -> f64 {
        self.counts_per_cm[axis.index()]
    }

    /// Distance in centimetres to controller counts, rounded toward negative infinity.
    pub fn to_counts(&self, axis: Axis, distance_cm: f64) -> i64 {
        (distance_cm * self.counts_per_cm(axis)).floor() as i64
    }

    /// Controller counts to centimetres.
    pub fn to_distance(&self, axis: Axis, counts: i64) -> f64 {
        counts as f64 / self.counts_per_cm(axis)
    }

    /// Convert a vector of distances.
    pub fn to_counts_all(&self, distance_cm: [f64; 3]) -> [i64; 3] {
        Axis::ALL.map(|axis| self.to_counts(axis, distance_cm[axis.index()]))
    }

    /// Largest distance, in centimetres, the controller's 32-bit position
    /// registers can represent on `axis`.
    pub fn counter_range_cm(&self, axis: Axis) -> f64 {
        f64::from(i32::MAX) / self.counts_per_cm(axis)
    }

    /// Convert a caller-supplied position or displacement to counts.
    ///
    /// Rejects NaN, infinities and values outside the counter range, which would
    /// otherwise saturate or collapse to zero in the conversion.
    pub fn checked_counts(
        &self,
        quantity: &'static str,
        distance_cm: [f64; 3],
    ) -> Result<[i64; 3], OutOfRange> {
        for axis in Axis::ALL {
            let value = distance_cm[axis.index()];
            let limit = self.counter_range_cm(axis);
            if !value.is_finite() || value.abs() > limit {
                return Err(OutOfRange {
                    quantity,
                    value,
                    min: -limit,
                    max: limit,
                });
            }
        }
        Ok(self.to_counts_all(distance_cm))
    }

    /// Convert a vector of counts.
    pub fn to_distance_all(&self, counts: [i64; 3]) -> [f64; 3] {
        Axis::ALL.map(|axis| self.to_distance(axis, counts[axis.index()]))
    }

    /// Per-axis controller speed for a stage speed in cm/s.
    ///
    /// The vertical axis runs at a fixed fraction of the requested speed.
    pub fn scale_speed(&self, speed_cm_s: f64) -> PerAxisSpeed {
        PerAxisSpeed(Axis::ALL.map(|axis| {
            let speed = match axis {
                Axis::Vertical => speed_cm_s * self.vertical_speed_factor,
                _ => speed_cm_s,
            };
            (speed * self.counts_per_cm(axis)).floor() as i64
        }))
    }

    /// Validate a stage speed against the envelope and scale it.
    pub fn set_speed(&self, speed_cm_s: f64) -> Result<PerAxisSpeed, OutOfRange> {
        if !(self.min_speed..=self.max_speed).contains(&speed_cm_s) {
            return Err(OutOfRange {
                quantity: "speed",
                value: speed_cm_s,
                min: self.min_speed,
                max: self.max_speed,
            });
        }
        Ok(self.scale_speed(speed_cm_s))
    }

    /// Slowest speed in the envelope, scaled.
    pub fn min_speed(&self) -> PerAxisSpeed {
        self.scale_speed(self.min_speed)
    }
}

impl Default for AxisModel {
    fn default() -> Self {
        Self::new(&MotionConfig::default())
    }
}
