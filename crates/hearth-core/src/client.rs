//! Client side of a build request.
//!
//! Finds the running build server through its port file, connects over
//! loopback TCP, and runs a single request/response exchange.

use crate::config::{self, ProtocolConfig};
use crate::portfile::PortFile;
use crate::protocol::{self, LogSink};
use crate::{HearthError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Sends build requests to the server advertised by a port file.
#[derive(Debug)]
pub struct BuildClient {
    port_file: PortFile,
    timeout: Duration,
}

impl BuildClient {
    /// Create a client for the port file at `path`.
    ///
    /// The wait timeout defaults to `HEARTH_PORT_TIMEOUT` seconds, or 60.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_port_file(PortFile::new(path))
    }

    pub fn with_port_file(port_file: PortFile) -> Self {
        Self {
            port_file,
            timeout: config::port_wait_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn port_file(&self) -> &PortFile {
        &self.port_file
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for a valid port file and open a connection to its server.
    pub async fn connect(&self) -> Result<TcpStream> {
        let record = self.port_file.wait_for_valid_record(self.timeout).await?;
        let port = record.port;

        let stream = tokio::time::timeout(
            ProtocolConfig::CONNECT_TIMEOUT,
            TcpStream::connect(record.addr()),
        )
        .await
        .map_err(|_| HearthError::Connect {
            port,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|source| HearthError::Connect { port, source })?;

        debug!("Connected to build server on port {}", port);
        Ok(stream)
    }

    /// Send `args` to the server and return its exit code.
    ///
    /// Log lines are passed to `sink` as they arrive.
    pub async fn compile<A, S>(&self, args: &[A], sink: &mut S) -> Result<i32>
    where
        A: AsRef<str>,
        S: LogSink + ?Sized,
    {
        let mut stream = self.connect().await?;
        protocol::exchange(&mut stream, args, sink).await
    }
}
