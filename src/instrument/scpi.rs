//! SCPI over TCP instrument port.
//!
//! Line-oriented SCPI on a raw socket (LXI instruments listen on 5025). The
//! connection is opened by `find()`, which also records the `*IDN?` reply.
//! Replies are bounded by a read timeout; the core itself adds none.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{InstrumentPort, PortStatus};

/// Default raw-socket SCPI port
pub const DEFAULT_PORT: u16 = 5025;

/// Default reply timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Instrument reached through SCPI over TCP.
pub struct ScpiPort {
    address: String,
    stream: Mutex<Option<BufReader<TcpStream>>>,
    timeout: Duration,
    status: SyncMutex<PortStatus>,
}

impl ScpiPort {
    /// Create a port for `address` (`host` or `host:port`). No I/O happens
    /// until `find()`.
    pub fn new(address: impl Into<String>) -> Self {
        let mut address = address.into();
        if !address.contains(':') {
            address = format!("{address}:{DEFAULT_PORT}");
        }
        Self {
            address,
            stream: Mutex::new(None),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            status: SyncMutex::new(PortStatus::Unknown),
        }
    }

    /// Override the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn open(&self) -> Result<String> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .with_context(|| format!("Connection timeout to {}", self.address))?
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        stream.set_nodelay(true)?;

        *self.stream.lock().await = Some(BufReader::new(stream));
        self.query("*IDN?").await
    }

    async fn write_line(stream: &mut BufReader<TcpStream>, command: &str) -> Result<()> {
        let line = format!("{command}\n");
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {command}"))?;
        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush stream")
    }

    fn fail(&self, err: anyhow::Error) -> anyhow::Error {
        *self.status.lock() = PortStatus::Failed(format!("{err:#}"));
        err
    }
}

#[async_trait]
impl InstrumentPort for ScpiPort {
    fn name(&self) -> &str {
        &self.address
    }

    async fn find(&self) -> bool {
        match self.open().await {
            Ok(idn) => {
                tracing::info!(address = %self.address, idn = %idn, "SCPI instrument identified");
                *self.status.lock() = PortStatus::Found(idn);
                true
            }
            Err(e) => {
                tracing::warn!(address = %self.address, error = %e, "SCPI discovery failed");
                *self.status.lock() = PortStatus::NotFound;
                false
            }
        }
    }

    async fn send(&self, command: &str) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .with_context(|| format!("{} is not connected", self.address))?;

        tracing::debug!(address = %self.address, command, "SCPI write");
        Self::write_line(stream, command)
            .await
            .map_err(|e| self.fail(e))
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .with_context(|| format!("{} is not connected", self.address))?;

        tracing::debug!(address = %self.address, command, "SCPI query");
        Self::write_line(stream, command)
            .await
            .map_err(|e| self.fail(e))?;

        let mut response = String::new();
        match timeout(self.timeout, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(self.fail(anyhow::anyhow!("Connection closed by device"))),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::debug!(address = %self.address, response = %trimmed, "SCPI response");
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(self.fail(anyhow::Error::new(e).context("Failed to read response"))),
            Err(_) => Err(self.fail(anyhow::anyhow!(
                "Timeout waiting for response to: {command}"
            ))),
        }
    }

    fn status(&self) -> PortStatus {
        self.status.lock().clone()
    }
}
