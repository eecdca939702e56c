//! Controller transports.
//!
//! A [`Transport`] carries one ASCII command to the motion controller and returns
//! its response. Two implementations exist:
//!
//! - [`GalilTransport`]: the real controller over USB-serial or TCP
//! - [`DummyTransport`]: an in-process simulation used offline and in tests
//!
//! Both are wrapped in a [`SharedTransport`], which serializes access so that
//! command/response pairs never interleave on the wire.

pub mod dummy;
pub mod galil;

pub use dummy::{DummyRig, DummyTransport, SimLayout};
pub use galil::GalilTransport;

use crate::config::{ConnectionConfig, TransportKind};
use crate::error::{CommError, RigError};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default TCP port of the controller's command interpreter.
pub const DEFAULT_TCP_PORT: u16 = 23;

/// Where the controller is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// USB-serial port, e.g. `COM4` or `/dev/ttyUSB0`
    Serial {
        /// Port name
        port: String,
    },
    /// Network address
    Tcp {
        /// Host name or IP address
        host: String,
        /// TCP port
        port: u16,
    },
}

impl Endpoint {
    /// Parse, using `default_tcp_port` when a network address carries no port.
    ///
    /// `COM*` and `/dev/*` names are serial ports; anything else is a network host.
    pub fn parse_with_port(s: &str, default_tcp_port: u16) -> Result<Self, RigError> {
        let s = s.trim();
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(RigError::InvalidEndpoint(s.to_string()));
        }

        if s.to_ascii_uppercase().starts_with("COM") || s.starts_with("/dev/") {
            return Ok(Endpoint::Serial {
                port: s.to_string(),
            });
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| RigError::InvalidEndpoint(s.to_string()))?;
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            Some(_) => Err(RigError::InvalidEndpoint(s.to_string())),
            None => Ok(Endpoint::Tcp {
                host: s.to_string(),
                port: default_tcp_port,
            }),
        }
    }

    /// Whether this is a serial port (controller echo must be turned off).
    pub fn is_serial(&self) -> bool {
        matches!(self, Endpoint::Serial { .. })
    }
}

impl FromStr for Endpoint {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse_with_port(s, DEFAULT_TCP_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { port } => write!(f, "{}", port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Byte-level link to the motion controller.
///
/// Implementations own the channel; callers go through [`SharedTransport`].
#[async_trait]
pub trait Transport: Send {
    /// Open the channel. Opening an already open transport reopens it.
    async fn open(&mut self, endpoint: &Endpoint) -> Result<(), CommError>;

    /// Send one command and return the response text with framing removed.
    async fn command(&mut self, command: &str) -> Result<String, CommError>;

    /// Close the channel. Closing a closed transport is a no-op.
    async fn close(&mut self) -> Result<(), CommError>;

    /// Whether the channel is open.
    fn is_open(&self) -> bool;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Lock-protected transport shared by everything that talks to the controller.
#[derive(Clone)]
pub struct SharedTransport {
    inner: Arc<Mutex<Box<dyn Transport>>>,
}

impl SharedTransport {
    /// Wrap a transport.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(transport)),
        }
    }

    /// Open the underlying channel.
    pub async fn open(&self, endpoint: &Endpoint) -> Result<(), CommError> {
        let mut guard = self.inner.lock().await;
        guard.open(endpoint).await?;
        tracing::info!(transport = %guard.describe(), "Controller link open");
        Ok(())
    }

    /// Send a command under the lock.
    pub async fn send(&self, command: &str) -> Result<String, CommError> {
        let mut guard = self.inner.lock().await;
        let result = guard.command(command).await;
        match &result {
            Ok(response) => tracing::trace!(command, response = %response, "controller"),
            Err(e) => tracing::debug!(command, error = %e, "controller command failed"),
        }
        result
    }

    /// Close the underlying channel.
    pub async fn close(&self) -> Result<(), CommError> {
        let mut guard = self.inner.lock().await;
        if guard.is_open() {
            tracing::info!(transport = %guard.describe(), "Closing controller link");
        }
        guard.close().await
    }

    /// Whether the underlying channel is open.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_open()
    }
}

impl fmt::Debug for SharedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTransport").finish_non_exhaustive()
    }
}

/// Build the transport selected in the configuration.
///
/// The dummy transport gets a fresh simulated rig with the default layout.
pub fn transport_from_config(config: &ConnectionConfig) -> Box<dyn Transport> {
    match config.transport {
        TransportKind::Galil => Box::new(GalilTransport::new(config)),
        TransportKind::Dummy => Box::new(DummyRig::default().transport()),
    }
}
