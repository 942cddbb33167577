//! Hearth Core - discovery and wire protocol for a persistent build daemon.
//!
//! A long-running build server advertises its loopback port and a random
//! cookie in a small port file. Client processes find the server through that
//! file, send one request per connection, and read back leveled log lines
//! followed by an exit code.
//!
//! The compilation work itself is supplied by the embedding application
//! through [`CompileService`]; spawning the daemon process is left to the
//! caller as well.
//!
//! # Example
//!
//! ```rust,ignore
//! use hearth_core::{BuildClient, TracingSink};
//!
//! #[tokio::main]
//! async fn main() -> hearth_core::Result<()> {
//!     let client = BuildClient::new("/tmp/hearth/hearth.port");
//!     let code = client.compile(&["-d", "out", "Main.java"], &mut TracingSink).await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod portfile;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use client::BuildClient;
pub use config::{PortFileTimings, ServerOptions};
pub use error::{HearthError, Result};
pub use portfile::{PortFile, PortFileLock, PortRecord};
pub use protocol::{CompileResult, LogLevel, LogSink, TracingSink, ERROR_EXIT_CODE};
pub use server::{BuildServer, BuildServerHandle, CompileService, ResponseLog, ShutdownReason};
