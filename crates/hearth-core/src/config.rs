//! Centralized configuration for Hearth.
//!
//! This module provides configuration constants for the port file, the wire
//! protocol, and the daemon loops, plus the tunable structs built from them.

use std::path::PathBuf;
use std::time::Duration;

/// Port file format and polling configuration.
pub struct PortFileConfig;

impl PortFileConfig {
    /// Format sentinel stored in the first four bytes of the record.
    pub const MAGIC: i32 = 0x1174;
    pub const RECORD_LEN: usize = 16;
    pub const STOP_SUFFIX: &'static str = ".stop";

    pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const DELETE_ATTEMPTS: u32 = 10;
    pub const DELETE_RETRY_INTERVAL: Duration = Duration::from_secs(1);
    pub const DELETE_GRACE: Duration = Duration::from_secs(1);

    pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const TIMEOUT_ENV_VAR: &'static str = "HEARTH_PORT_TIMEOUT";
}

/// Wire protocol limits.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1MB
    pub const MAX_ARGS: usize = 65_536;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Daemon loop configuration.
pub struct ServerConfig;

impl ServerConfig {
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 64;
    /// How long to wait when probing whether an advertised server is alive.
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
    /// Pause after a failed `accept` (e.g. out of file descriptors).
    pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
}

/// Shared directory and file names.
pub struct PathsConfig;

impl PathsConfig {
    pub const APP_DIR_NAME: &'static str = "hearth";
    pub const PORT_FILE_NAME: &'static str = "hearth.port";
}

/// Retry and polling intervals used by `PortFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFileTimings {
    pub poll_interval: Duration,
    pub delete_attempts: u32,
    pub delete_retry_interval: Duration,
    /// Pause after a successful delete so late readers can finish.
    pub delete_grace: Duration,
}

impl Default for PortFileTimings {
    fn default() -> Self {
        Self {
            poll_interval: PortFileConfig::POLL_INTERVAL,
            delete_attempts: PortFileConfig::DELETE_ATTEMPTS,
            delete_retry_interval: PortFileConfig::DELETE_RETRY_INTERVAL,
            delete_grace: PortFileConfig::DELETE_GRACE,
        }
    }
}

/// Tunables for a running `BuildServer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub idle_timeout: Duration,
    pub monitor_interval: Duration,
    pub max_connections: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: ServerConfig::IDLE_TIMEOUT,
            monitor_interval: ServerConfig::MONITOR_INTERVAL,
            max_connections: ServerConfig::MAX_CONNECTIONS,
        }
    }
}

/// Parse a wait-timeout override given in whole seconds.
///
/// Missing or unparsable values fall back to the 60 second default.
pub fn parse_wait_timeout(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(PortFileConfig::DEFAULT_WAIT_TIMEOUT)
}

/// Deadline for `PortFile::wait_for_valid_record`, honouring `HEARTH_PORT_TIMEOUT`.
pub fn port_wait_timeout() -> Duration {
    let value = std::env::var(PortFileConfig::TIMEOUT_ENV_VAR).ok();
    parse_wait_timeout(value.as_deref())
}

/// Default port file location.
///
/// # Platform Behavior
/// - **Linux**: `$XDG_RUNTIME_DIR/hearth/hearth.port`, falling back to the cache dir
/// - **Windows/macOS**: `{cache dir}/hearth/hearth.port`
pub fn default_port_file() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(PathsConfig::APP_DIR_NAME)
        .join(PathsConfig::PORT_FILE_NAME)
}
