//! Rig configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the values of the lab rig)
//! 2. `config/rig.toml` (or any file passed to [`RigConfig::load_from`])
//! 3. Environment variables prefixed with `NEARFIELD_`, nested keys split on `__`
//!
//! Durations are written in humantime notation (`"20ms"`, `"3m"`).
//!
//! # Example
//! ```no_run
//! use nearfield_rig::config::RigConfig;
//!
//! // NEARFIELD_TIMING__POLL_INTERVAL=50ms overrides the file value
//! let config = RigConfig::load()?;
//! config.validate()?;
//! println!("Controller at {}", config.connection.endpoint);
//! # Ok::<(), nearfield_rig::error::RigError>(())
//! ```

use crate::error::{RigError, RigResult};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/rig.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "NEARFIELD_";

/// Top-level rig configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Motion controller link
    pub connection: ConnectionConfig,
    /// Axis geometry, speeds and travel bounds
    pub motion: MotionConfig,
    /// Poll intervals and waits
    pub timing: TimingConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Which transport implementation backs the controller link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Real Galil controller over serial or TCP
    #[default]
    Galil,
    /// In-process simulated controller
    Dummy,
}

/// Motion controller link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port (`COM4`, `/dev/ttyUSB0`) or network address of the controller
    pub endpoint: String,
    /// TCP port used when the endpoint has none
    pub tcp_port: u16,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Maximum wait for a response terminator
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Transport implementation
    pub transport: TransportKind,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "134.117.39.147".to_string(),
            tcp_port: 23,
            baud_rate: 115_200,
            response_timeout: Duration::from_secs(2),
            transport: TransportKind::Galil,
        }
    }
}

/// Axis geometry and motion envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Encoder counts per centimetre for lateral, transverse, vertical
    pub counts_per_cm: [f64; 3],
    /// Slowest permitted speed (cm/s)
    pub min_speed: f64,
    /// Fastest permitted speed (cm/s)
    pub max_speed: f64,
    /// Multiplier applied to the vertical axis speed
    pub vertical_speed_factor: f64,
    /// Speed used while homing (cm/s)
    pub homing_speed: f64,
    /// Forward probe used to tell which lateral limit is active (cm)
    pub probe_distance: f64,
    /// Distance each axis backs away from its reference before seeking it (cm)
    pub backoff_distance: f64,
    /// Lowest allowed vertical position after homing (cm)
    pub vertical_floor: f64,
    /// Highest allowed transverse position after homing (cm)
    pub transverse_ceiling: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            counts_per_cm: [4385.0, 4385.0, 12710.0],
            min_speed: 0.2,
            max_speed: 6.0,
            vertical_speed_factor: 0.33,
            homing_speed: 5.0,
            probe_distance: 1.5,
            backoff_distance: 1.0,
            vertical_floor: -25.0,
            transverse_ceiling: 120.0,
        }
    }
}

/// Poll intervals, settle times and timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Queue dequeue timeout, i.e. the idle poll period of the background loop
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Sleep between completion checks while homing
    #[serde(with = "humantime_serde")]
    pub retry_sleep: Duration,
    /// Pause after reset and after homing completes
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Wait between motor-off and motor-on when clearing controller faults
    #[serde(with = "humantime_serde")]
    pub fault_clear_wait: Duration,
    /// Upper bound on any single homing wait
    #[serde(with = "humantime_serde")]
    pub homing_timeout: Duration,
    /// Caller-side poll period of `move_absolute_blocking`
    #[serde(with = "humantime_serde")]
    pub blocking_poll_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            retry_sleep: Duration::from_millis(250),
            settle_time: Duration::from_millis(250),
            fault_clear_wait: Duration::from_secs(2),
            homing_timeout: Duration::from_secs(180),
            blocking_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> RigResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> RigResult<Self> {
        let config = Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> RigResult<()> {
        let m = &self.motion;

        if let Some(bad) = m.counts_per_cm.iter().find(|c| !c.is_finite() || **c <= 0.0) {
            return Err(RigError::Configuration(format!(
                "counts_per_cm must be positive, got {}",
                bad
            )));
        }

        if m.min_speed <= 0.0 || m.min_speed > m.max_speed {
            return Err(RigError::Configuration(format!(
                "Invalid speed envelope [{}, {}]",
                m.min_speed, m.max_speed
            )));
        }

        if m.homing_speed < m.min_speed || m.homing_speed > m.max_speed {
            return Err(RigError::Configuration(format!(
                "homing_speed {} outside [{}, {}]",
                m.homing_speed, m.min_speed, m.max_speed
            )));
        }

        if m.vertical_speed_factor <= 0.0 {
            return Err(RigError::Configuration(
                "vertical_speed_factor must be positive".to_string(),
            ));
        }

        if m.probe_distance <= 0.0 || m.backoff_distance <= 0.0 {
            return Err(RigError::Configuration(
                "probe_distance and backoff_distance must be positive".to_string(),
            ));
        }

        if self.timing.poll_interval.is_zero() {
            return Err(RigError::Configuration(
                "timing.poll_interval must be non-zero".to_string(),
            ));
        }

        if self.timing.blocking_poll_interval.is_zero() {
            return Err(RigError::Configuration(
                "timing.blocking_poll_interval must be non-zero".to_string(),
            ));
        }

        crate::logging::parse_log_level(&self.logging.level).map_err(RigError::Configuration)?;

        Ok(())
    }
}
