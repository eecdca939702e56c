//! Controller command language.
//!
//! [`Command`] and [`Query`] render to the ASCII the controller firmware expects
//! and parse back from it (the simulated controller decodes with the same code).
//! [`ControllerLink`] sends them over a [`SharedTransport`] and decodes typed
//! responses.

use crate::adapters::{Endpoint, SharedTransport};
use crate::axis::Channel;
use crate::controller::{ErrorKind, StopCode};
use crate::error::CommError;
use std::fmt;
use std::str::FromStr;

/// Hardware limit-switch enablement written with `LD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitDisable {
    /// Both switches enabled
    #[default]
    None = 0,
    /// Forward switch ignored
    Forward = 1,
    /// Reverse switch ignored
    Reverse = 2,
    /// Both switches ignored
    Both = 3,
}

impl LimitDisable {
    /// Decode the `LD` operand.
    pub fn from_code(code: i64) -> Option<LimitDisable> {
        match code {
            0 => Some(LimitDisable::None),
            1 => Some(LimitDisable::Forward),
            2 => Some(LimitDisable::Reverse),
            3 => Some(LimitDisable::Both),
            _ => None,
        }
    }

    /// Whether the forward switch stops motion.
    pub fn forward_enabled(self) -> bool {
        matches!(self, LimitDisable::None | LimitDisable::Reverse)
    }

    /// Whether the reverse switch stops motion.
    pub fn reverse_enabled(self) -> bool {
        matches!(self, LimitDisable::None | LimitDisable::Forward)
    }
}

/// Commands that change controller state.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `RS`: reset to power-on state
    Reset,
    /// `EO0`: echo off (serial links echo by default)
    EchoOff,
    /// `MT`: motor type on all channels; negative reverses direction
    MotorType(f64),
    /// `AG`: amplifier current gain on all channels
    AmplifierGain(u8),
    /// `GA`: gear `slave` to the commanded position of `master`
    Gang {
        /// Geared channel
        slave: Channel,
        /// Driving channel
        master: Channel,
    },
    /// `GR`: gear ratio of a geared channel
    GearRatio(Channel, i64),
    /// `GM`: gantry mode (gearing survives `ST`)
    GantryMode(Channel, bool),
    /// `MO`: motors off
    MotorsOff,
    /// `SH`: servo here (motors on)
    ServoHere,
    /// `ST`: stop all motion
    Stop,
    /// `SP`: slew speed, counts/s
    Speed(Channel, i64),
    /// `PR`: relative target, counts
    PositionRelative(Channel, i64),
    /// `PA`: absolute target, counts
    PositionAbsolute(Channel, i64),
    /// `JG`: jog speed, signed counts/s
    Jog(Channel, i64),
    /// `BG`: begin motion on the listed channels
    Begin(Vec<Channel>),
    /// `LD`: limit-switch disable
    LimitDisable(Channel, LimitDisable),
    /// `BL`: software reverse limit, counts
    BackLimit(Channel, i64),
    /// `FL`: software forward limit, counts
    ForwardLimit(Channel, i64),
    /// `DP`: define current position
    DefinePosition(Channel, i64),
    /// `TC1`: describe the last error
    TellError,
}

impl Command {
    /// Whether this command starts or parameterises motion.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Command::PositionRelative(..)
                | Command::PositionAbsolute(..)
                | Command::Jog(..)
                | Command::Begin(_)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Reset => write!(f, "RS"),
            Command::EchoOff => write!(f, "EO0"),
            Command::MotorType(t) => write!(f, "MT {0},{0},{0},{0}", t),
            Command::AmplifierGain(g) => write!(f, "AG {0},{0},{0},{0}", g),
            Command::Gang { slave, master } => write!(f, "GA{}=C{}", slave, master),
            Command::GearRatio(ch, ratio) => write!(f, "GR{}={}", ch, ratio),
            Command::GantryMode(ch, on) => write!(f, "GM{}={}", ch, u8::from(*on)),
            Command::MotorsOff => write!(f, "MO"),
            Command::ServoHere => write!(f, "SH"),
            Command::Stop => write!(f, "ST"),
            Command::Speed(ch, v) => write!(f, "SP{}={}", ch, v),
            Command::PositionRelative(ch, v) => write!(f, "PR{}={}", ch, v),
            Command::PositionAbsolute(ch, v) => write!(f, "PA{}={}", ch, v),
            Command::Jog(ch, v) => write!(f, "JG{}={}", ch, v),
            Command::Begin(channels) => {
                write!(f, "BG")?;
                for ch in channels {
                    write!(f, "{}", ch)?;
                }
                Ok(())
            }
            Command::LimitDisable(ch, mode) => write!(f, "LD{}={}", ch, *mode as u8),
            Command::BackLimit(ch, v) => write!(f, "BL{}={}", ch, v),
            Command::ForwardLimit(ch, v) => write!(f, "FL{}={}", ch, v),
            Command::DefinePosition(ch, v) => write!(f, "DP{}={}", ch, v),
            Command::TellError => write!(f, "TC1"),
        }
    }
}

// "XXc=value" with a single channel letter
fn channel_assignment(rest: &str) -> Option<(Channel, &str)> {
    let mut chars = rest.chars();
    let channel = Channel::from_letter(chars.next()?)?;
    let value = chars.as_str().strip_prefix('=')?;
    Some((channel, value.trim()))
}

fn channel_int(rest: &str) -> Option<(Channel, i64)> {
    let (channel, value) = channel_assignment(rest)?;
    Some((channel, value.parse().ok()?))
}

// "MT a,a,a,a" style lists must repeat one value
fn uniform_list<T: FromStr + PartialEq + Copy>(rest: &str) -> Option<T> {
    let values: Vec<T> = rest
        .trim()
        .split(',')
        .map(|v| v.trim().parse().ok())
        .collect::<Option<_>>()?;
    let first = *values.first()?;
    (values.len() == 4 && values.iter().all(|v| *v == first)).then_some(first)
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unknown = || format!("Unrecognized command '{}'", s);
        if s.len() < 2 || !s.is_char_boundary(2) {
            return Err(unknown());
        }
        let (op, rest) = s.split_at(2);

        let parsed = match op {
            "RS" if rest.is_empty() => Some(Command::Reset),
            "EO" if rest == "0" => Some(Command::EchoOff),
            "MT" => uniform_list(rest).map(Command::MotorType),
            "AG" => uniform_list(rest).map(Command::AmplifierGain),
            "GA" => channel_assignment(rest).and_then(|(slave, value)| {
                let master = value.strip_prefix('C')?.chars().next()?;
                Some(Command::Gang {
                    slave,
                    master: Channel::from_letter(master)?,
                })
            }),
            "GR" => channel_int(rest).map(|(ch, v)| Command::GearRatio(ch, v)),
            "GM" => channel_int(rest).map(|(ch, v)| Command::GantryMode(ch, v != 0)),
            "MO" if rest.is_empty() => Some(Command::MotorsOff),
            "SH" if rest.is_empty() => Some(Command::ServoHere),
            "ST" if rest.is_empty() => Some(Command::Stop),
            "SP" => channel_int(rest).map(|(ch, v)| Command::Speed(ch, v)),
            "PR" => channel_int(rest).map(|(ch, v)| Command::PositionRelative(ch, v)),
            "PA" => channel_int(rest).map(|(ch, v)| Command::PositionAbsolute(ch, v)),
            "JG" => channel_int(rest).map(|(ch, v)| Command::Jog(ch, v)),
            "BG" => rest
                .chars()
                .map(Channel::from_letter)
                .collect::<Option<Vec<_>>>()
                .filter(|channels| !channels.is_empty())
                .map(Command::Begin),
            "LD" => channel_int(rest).and_then(|(ch, v)| {
                LimitDisable::from_code(v).map(|mode| Command::LimitDisable(ch, mode))
            }),
            "BL" => channel_int(rest).map(|(ch, v)| Command::BackLimit(ch, v)),
            "FL" => channel_int(rest).map(|(ch, v)| Command::ForwardLimit(ch, v)),
            "DP" => channel_int(rest).map(|(ch, v)| Command::DefinePosition(ch, v)),
            "TC" if rest == "1" => Some(Command::TellError),
            _ => None,
        };

        parsed.ok_or_else(unknown)
    }
}

/// Telemetry reads, all sent as `MG_` operand queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// `MG_TD`: step count (position)
    Position(Channel),
    /// `MG_SC`: stop code
    StopCode(Channel),
    /// `MG_LF`: forward limit input, active low
    ForwardLimit(Channel),
    /// `MG_LR`: reverse limit input, active low
    ReverseLimit(Channel),
    /// `MG_TA`: amplifier fault register 0..=3
    Fault(u8),
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Position(ch) => write!(f, "MG_TD{}", ch),
            Query::StopCode(ch) => write!(f, "MG_SC{}", ch),
            Query::ForwardLimit(ch) => write!(f, "MG_LF{}", ch),
            Query::ReverseLimit(ch) => write!(f, "MG_LR{}", ch),
            Query::Fault(n) => write!(f, "MG_TA{}", n),
        }
    }
}

impl FromStr for Query {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unknown = || format!("Unrecognized query '{}'", s);
        let operand = s.strip_prefix("MG_").ok_or_else(unknown)?;
        if operand.len() != 3 || !operand.is_char_boundary(2) {
            return Err(unknown());
        }
        let (name, arg) = operand.split_at(2);
        let channel = || arg.chars().next().and_then(Channel::from_letter);

        let parsed = match name {
            "TD" => channel().map(Query::Position),
            "SC" => channel().map(Query::StopCode),
            "LF" => channel().map(Query::ForwardLimit),
            "LR" => channel().map(Query::ReverseLimit),
            "TA" => arg.parse::<u8>().ok().filter(|n| *n < 4).map(Query::Fault),
            _ => None,
        };
        parsed.ok_or_else(unknown)
    }
}

/// Active state of both limit inputs of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitFlags {
    /// Forward input active
    pub forward: bool,
    /// Reverse input active
    pub reverse: bool,
}

/// Typed access to the controller over a shared transport.
#[derive(Debug, Clone)]
pub struct ControllerLink {
    transport: SharedTransport,
}

impl ControllerLink {
    /// Wrap a shared transport.
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }

    /// Open the transport.
    pub async fn open(&self, endpoint: &Endpoint) -> Result<(), CommError> {
        self.transport.open(endpoint).await
    }

    /// Close the transport.
    pub async fn close(&self) -> Result<(), CommError> {
        self.transport.close().await
    }

    /// Send a command, discarding its (empty) response.
    pub async fn execute(&self, command: &Command) -> Result<(), CommError> {
        self.transport.send(&command.to_string()).await.map(|_| ())
    }

    /// Send a query and parse the numeric response.
    pub async fn query(&self, query: Query) -> Result<f64, CommError> {
        let command = query.to_string();
        let response = self.transport.send(&command).await?;
        response
            .trim()
            .parse::<f64>()
            .map_err(|_| CommError::Malformed { command, response })
    }

    /// Position of a channel in counts.
    pub async fn position(&self, channel: Channel) -> Result<i64, CommError> {
        Ok(self.query(Query::Position(channel)).await?.floor() as i64)
    }

    /// Stop code of a channel.
    pub async fn stop_code(&self, channel: Channel) -> Result<StopCode, CommError> {
        let code = self.query(Query::StopCode(channel)).await?;
        Ok(StopCode::from_code(code as i64))
    }

    /// Both limit inputs of a channel. The controller reports 0 for an active input.
    pub async fn limit_flags(&self, channel: Channel) -> Result<LimitFlags, CommError> {
        let forward = self.query(Query::ForwardLimit(channel)).await?;
        let reverse = self.query(Query::ReverseLimit(channel)).await?;
        Ok(LimitFlags {
            forward: forward == 0.0,
            reverse: reverse == 0.0,
        })
    }

    /// Forward limit input of a channel.
    pub async fn forward_limit_active(&self, channel: Channel) -> Result<bool, CommError> {
        Ok(self.query(Query::ForwardLimit(channel)).await? == 0.0)
    }

    /// Controller fault flags that are currently set.
    pub async fn faults(&self) -> Result<Vec<ErrorKind>, CommError> {
        let mut set = Vec::new();
        for (n, kind) in (0u8..).zip(ErrorKind::CONTROLLER_FLAGS) {
            if self.query(Query::Fault(n)).await? != 0.0 {
                set.push(kind);
            }
        }
        Ok(set)
    }
}
