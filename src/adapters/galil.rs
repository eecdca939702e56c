//! Galil DMC transport over USB-serial or TCP.
//!
//! Framing: each command is terminated with `\r`. The controller answers with any
//! output text followed by `:` on success or a bare `?` on error; after a `?` the
//! reason is fetched with `TC1`. Serial links echo commands until `EO0` is sent,
//! so a leading echo is stripped from responses.

use super::{Endpoint, Transport};
use crate::config::ConnectionConfig;
use crate::error::CommError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Any byte stream the controller can be reached over.
pub trait ControllerIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControllerIO for T {}

/// Type-erased controller stream.
pub type DynStream = Box<dyn ControllerIO>;

const TERMINATOR_OK: u8 = b':';
const TERMINATOR_ERR: u8 = b'?';
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// Transport for the real controller.
pub struct GalilTransport {
    stream: Option<BufReader<DynStream>>,
    endpoint: Option<Endpoint>,
    baud_rate: u32,
    response_timeout: Duration,
}

impl GalilTransport {
    /// Closed transport using the link settings of `config`.
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            stream: None,
            endpoint: None,
            baud_rate: config.baud_rate,
            response_timeout: config.response_timeout,
        }
    }

    /// Transport already attached to a stream (tests, custom links).
    pub fn with_stream(stream: DynStream, response_timeout: Duration) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
            endpoint: None,
            baud_rate: ConnectionConfig::default().baud_rate,
            response_timeout,
        }
    }

    async fn connect(
        endpoint: &Endpoint,
        baud_rate: u32,
        response_timeout: Duration,
    ) -> Result<DynStream, CommError> {
        match endpoint {
            Endpoint::Serial { port } => open_serial(port, baud_rate).await,
            Endpoint::Tcp { host, port } => {
                let connect = tokio::net::TcpStream::connect((host.as_str(), *port));
                let stream = tokio::time::timeout(response_timeout, connect)
                    .await
                    .map_err(|_| CommError::Open {
                        endpoint: endpoint.to_string(),
                        reason: format!("no answer within {:?}", response_timeout),
                    })?
                    .map_err(|e| CommError::Open {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    })?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    // Discard anything the controller sent before we started talking.
    async fn drain(&mut self) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };
        let mut discard = [0u8; 256];
        let mut total = 0;
        while let Ok(Ok(n)) = tokio::time::timeout(DRAIN_TIMEOUT, stream.read(&mut discard)).await
        {
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    async fn exchange(&mut self, command: &str) -> Result<(String, bool), CommError> {
        let stream = self.stream.as_mut().ok_or(CommError::NotConnected)?;

        let mut frame = Vec::with_capacity(command.len() + 1);
        frame.extend_from_slice(command.as_bytes());
        frame.push(b'\r');
        stream.get_mut().write_all(&frame).await?;
        stream.get_mut().flush().await?;

        let read = async {
            let mut body = Vec::new();
            loop {
                let byte = stream.read_u8().await.map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => CommError::UnexpectedEof,
                    _ => CommError::Io(e),
                })?;
                match byte {
                    TERMINATOR_OK => return Ok::<_, CommError>((body, true)),
                    TERMINATOR_ERR => return Ok((body, false)),
                    other => body.push(other),
                }
            }
        };

        let (body, ok) = tokio::time::timeout(self.response_timeout, read)
            .await
            .map_err(|_| CommError::Timeout {
                command: command.to_string(),
                timeout: self.response_timeout,
            })??;

        Ok((clean_response(command, &body), ok))
    }
}

// Strip a leading echo and surrounding whitespace.
fn clean_response(command: &str, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    text.strip_prefix(command).unwrap_or(text).trim().to_string()
}

#[async_trait]
impl Transport for GalilTransport {
    async fn open(&mut self, endpoint: &Endpoint) -> Result<(), CommError> {
        self.close().await?;
        let stream = Self::connect(endpoint, self.baud_rate, self.response_timeout).await?;
        self.stream = Some(BufReader::new(stream));
        self.endpoint = Some(endpoint.clone());

        let stale = self.drain().await;
        if stale > 0 {
            tracing::debug!(bytes = stale, "Discarded stale controller output");
        }
        Ok(())
    }

    async fn command(&mut self, command: &str) -> Result<String, CommError> {
        let (response, ok) = self.exchange(command).await?;
        if ok {
            return Ok(response);
        }

        let reason = match self.exchange("TC1").await {
            Ok((reason, true)) if !reason.is_empty() => reason,
            _ => "unknown error".to_string(),
        };
        Err(CommError::Rejected {
            command: command.to_string(),
            reason,
        })
    }

    async fn close(&mut self) -> Result<(), CommError> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone
            let _ = stream.get_mut().shutdown().await;
        }
        self.endpoint = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn describe(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("Galil DMC at {}", endpoint),
            None if self.stream.is_some() => "Galil DMC (attached stream)".to_string(),
            None => "Galil DMC (closed)".to_string(),
        }
    }
}

#[cfg(feature = "instrument_serial")]
async fn open_serial(port: &str, baud_rate: u32) -> Result<DynStream, CommError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port.to_string();
    let opened = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| CommError::Open {
        endpoint: port.to_string(),
        reason: format!("spawn_blocking failed: {}", e),
    })?;

    let stream = opened.map_err(|e| CommError::Open {
        endpoint: port.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Box::new(stream))
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_serial(_port: &str, _baud_rate: u32) -> Result<DynStream, CommError> {
    Err(CommError::SerialFeatureDisabled)
}
