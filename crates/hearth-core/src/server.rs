//! TCP build server that advertises itself through a port file.
//!
//! Listens on `127.0.0.1:0` (OS-assigned port), writes the port and a fresh
//! cookie to the port file, and serves one request per connection by handing
//! the arguments to a [`CompileService`].
//!
//! # Shutdown
//!
//! The server stops when any of these happen:
//! - [`BuildServerHandle::shutdown`] is called
//! - the stop marker appears next to the port file
//! - the port file disappears or no longer holds this server's values
//! - no connection arrives for the idle timeout while none are active
//!
//! On the way out the port file is deleted, unless another server already owns it.

use crate::config::{ServerConfig, ServerOptions};
use crate::portfile::{random_cookie, PortFile, PortRecord};
use crate::protocol::{read_command, send_exit_code, send_log, LogLevel};
use crate::{HearthError, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a build server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Requested,
    StopMarker,
    PortFileRemoved,
    OwnershipLost,
    IdleTimeout,
    MonitorFailed,
}

/// The compilation work behind the server.
#[async_trait::async_trait]
pub trait CompileService: Send + Sync + 'static {
    /// Handle one request and return its exit code.
    async fn compile(&self, args: Vec<String>, log: &mut ResponseLog) -> i32;
}

/// Log channel back to the requesting client.
///
/// Write failures (client went away) are remembered and further output is
/// dropped; the compilation itself carries on.
#[derive(Debug)]
pub struct ResponseLog {
    writer: OwnedWriteHalf,
    disconnected: bool,
}

impl ResponseLog {
    fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer,
            disconnected: false,
        }
    }

    pub async fn log(&mut self, level: LogLevel, message: &str) {
        if self.disconnected {
            return;
        }
        if let Err(e) = send_log(&mut self.writer, level, message).await {
            debug!("Client stopped reading build output: {}", e);
            self.disconnected = true;
        }
    }

    pub async fn error(&mut self, message: &str) {
        self.log(LogLevel::Error, message).await
    }

    pub async fn warn(&mut self, message: &str) {
        self.log(LogLevel::Warn, message).await
    }

    pub async fn info(&mut self, message: &str) {
        self.log(LogLevel::Info, message).await
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    async fn finish(mut self, code: i32) -> Result<()> {
        send_exit_code(&mut self.writer, code).await
    }
}

/// Handle to a running build server.
///
/// Dropping the handle asks the server to shut down; use
/// [`BuildServerHandle::wait`] to observe cleanup.
pub struct BuildServerHandle {
    addr: SocketAddr,
    record: PortRecord,
    shutdown_tx: watch::Sender<Option<ShutdownReason>>,
    task: Option<JoinHandle<Result<ShutdownReason>>>,
}

impl BuildServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.record.port
    }

    pub fn cookie(&self) -> i64 {
        self.record.cookie
    }

    /// Ask the server to stop accepting connections and clean up.
    pub fn shutdown(&self) {
        signal_shutdown(&self.shutdown_tx, ShutdownReason::Requested);
    }

    /// Wait for the server to stop and its port file cleanup to finish.
    pub async fn wait(mut self) -> Result<ShutdownReason> {
        let Some(task) = self.task.take() else {
            return Ok(ShutdownReason::Requested);
        };
        task.await
            .map_err(|e| HearthError::Other(format!("Build server task failed: {}", e)))?
    }
}

impl Drop for BuildServerHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown();
        }
    }
}

/// Build server bootstrap.
pub struct BuildServer;

impl BuildServer {
    /// Claim the port file and start serving.
    ///
    /// # Errors
    ///
    /// [`HearthError::AlreadyRunning`] if the port file advertises a server
    /// that still accepts connections. A record whose port refuses
    /// connections is treated as stale and overwritten.
    pub async fn start<S: CompileService>(
        port_file: Arc<PortFile>,
        service: Arc<S>,
        options: ServerOptions,
    ) -> Result<BuildServerHandle> {
        let mut lock = port_file.lock().await?;

        if let Some(existing) = lock.read_record() {
            if is_listening(existing.addr()).await {
                lock.release();
                info!("Build server already running on port {}", existing.port);
                return Err(HearthError::AlreadyRunning {
                    port: existing.port,
                });
            }
            warn!(
                "Port file {} points at dead port {}, taking over",
                port_file.path().display(),
                existing.port
            );
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let record = PortRecord::new(addr.port(), random_cookie());
        lock.write_record(record)?;
        lock.release();

        info!("Build server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let task = tokio::spawn(Self::run(
            listener,
            port_file,
            service,
            options,
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        Ok(BuildServerHandle {
            addr,
            record,
            shutdown_tx,
            task: Some(task),
        })
    }

    async fn run<S: CompileService>(
        listener: TcpListener,
        port_file: Arc<PortFile>,
        service: Arc<S>,
        options: ServerOptions,
        shutdown_tx: watch::Sender<Option<ShutdownReason>>,
        shutdown_rx: watch::Receiver<Option<ShutdownReason>>,
    ) -> Result<ShutdownReason> {
        let monitor = tokio::spawn(Self::monitor_loop(
            port_file.clone(),
            options.monitor_interval,
            shutdown_tx.clone(),
        ));

        let reason = Self::accept_loop(listener, &port_file, service, options, shutdown_rx).await;
        monitor.abort();
        info!("Build server shutting down: {:?}", reason);

        Self::release_port_file(&port_file).await;
        Ok(reason)
    }

    async fn accept_loop<S: CompileService>(
        listener: TcpListener,
        port_file: &PortFile,
        service: Arc<S>,
        options: ServerOptions,
        mut shutdown_rx: watch::Receiver<Option<ShutdownReason>>,
    ) -> ShutdownReason {
        let active_connections = Arc::new(AtomicUsize::new(0));

        loop {
            if let Some(reason) = *shutdown_rx.borrow_and_update() {
                return reason;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return ShutdownReason::Requested;
                    }
                }
                _ = tokio::time::sleep(options.idle_timeout) => {
                    if active_connections.load(Ordering::SeqCst) == 0 {
                        return ShutdownReason::IdleTimeout;
                    }
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            match port_file.record_still_mine().await {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!(
                                        "Refusing connection from {}: port file now belongs to another server",
                                        peer_addr
                                    );
                                    return ShutdownReason::OwnershipLost;
                                }
                                Err(e) => {
                                    error!("Port file check failed on accept: {}", e);
                                    return ShutdownReason::MonitorFailed;
                                }
                            }

                            let current = active_connections.load(Ordering::SeqCst);
                            if current >= options.max_connections {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    options.max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::SeqCst);
                            let service = service.clone();
                            let conns = active_connections.clone();

                            tokio::spawn(async move {
                                debug!("Build request from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, &*service).await {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ServerConfig::ACCEPT_RETRY_DELAY).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<S: CompileService>(stream: TcpStream, service: &S) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let args = read_command(&mut reader).await?;
        debug!("Compiling with {} arguments", args.len());

        let mut log = ResponseLog::new(write_half);
        let code = service.compile(args, &mut log).await;
        if log.is_disconnected() {
            debug!("Client left before exit code {} could be sent", code);
            return Ok(());
        }
        log.finish(code).await
    }

    async fn monitor_loop(
        port_file: Arc<PortFile>,
        interval: Duration,
        shutdown_tx: watch::Sender<Option<ShutdownReason>>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let reason = if port_file.take_stop_request() {
                Some(ShutdownReason::StopMarker)
            } else if !port_file.exists() {
                Some(ShutdownReason::PortFileRemoved)
            } else {
                match port_file.record_still_mine().await {
                    Ok(true) => None,
                    Ok(false) => Some(ShutdownReason::OwnershipLost),
                    Err(e) => {
                        warn!("Port file monitor failed: {}", e);
                        Some(ShutdownReason::MonitorFailed)
                    }
                }
            };

            if let Some(reason) = reason {
                debug!("Port file monitor requesting shutdown: {:?}", reason);
                signal_shutdown(&shutdown_tx, reason);
                return;
            }
        }
    }

    async fn release_port_file(port_file: &PortFile) {
        match port_file.delete_if_mine().await {
            Ok(true) => {}
            Ok(false) => debug!(
                "Leaving port file {} in place, it is not ours",
                port_file.path().display()
            ),
            Err(e) => warn!(
                "Failed to clean up port file {}: {}",
                port_file.path().display(),
                e
            ),
        }
    }
}

/// Record the first shutdown reason; later ones are ignored.
fn signal_shutdown(tx: &watch::Sender<Option<ShutdownReason>>, reason: ShutdownReason) {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

async fn is_listening(addr: SocketAddr) -> bool {
    matches!(
        tokio::time::timeout(ServerConfig::PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
