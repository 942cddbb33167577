//! Hearth Ctl - operator tool for a hearth build daemon.
//!
//! Inspects the port file, asks the daemon to stop, or sends a single build
//! request and exits with the daemon's status code.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hearth_core::config::{self, ServerConfig};
use hearth_core::{BuildClient, CompileResult, PortFile, PortRecord, TracingSink};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "hearth-ctl")]
#[command(about = "Inspect and control a hearth build daemon")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct PortFileArg {
    /// Port file advertising the daemon
    #[arg(long, default_value_os_t = config::default_port_file())]
    port_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print whether a daemon is advertised and reachable, as JSON
    Status(PortFileArg),

    /// Ask the daemon to shut down
    Stop(PortFileArg),

    /// Send one build request and exit with its status
    Send {
        #[command(flatten)]
        target: PortFileArg,

        /// Seconds to wait for a valid port file
        #[arg(long)]
        timeout: Option<u64>,

        /// Arguments passed to the daemon, after `--`
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[derive(Serialize, Debug, PartialEq, Eq)]
struct Status {
    running: bool,
    port: Option<u16>,
    cookie: Option<i64>,
}

impl Status {
    fn new(record: Option<PortRecord>, running: bool) -> Self {
        Self {
            running,
            port: record.map(|r| r.port),
            cookie: record.map(|r| r.cookie),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Command::Status(target) => {
            let status = status(&target.port_file).await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        Command::Stop(target) => {
            let marker = PortFile::request_stop(&target.port_file).with_context(|| {
                format!("Failed to request stop for {}", target.port_file.display())
            })?;
            info!("Stop marker written to {}", marker.display());
        }
        Command::Send {
            target,
            timeout,
            args,
        } => {
            let mut client = BuildClient::new(&target.port_file);
            if let Some(secs) = timeout {
                client = client.with_timeout(Duration::from_secs(secs));
            }
            let code = client
                .compile(&args, &mut TracingSink)
                .await
                .context("Build request failed")?;
            match CompileResult::from_code(code) {
                Some(result) => debug!("Build server returned {} ({:?})", code, result),
                None => debug!("Build server returned non-standard code {}", code),
            }
            std::process::exit(code);
        }
    }

    Ok(())
}

async fn status(path: &std::path::Path) -> Result<Status> {
    let port_file = PortFile::new(path);
    if !port_file.exists() {
        return Ok(Status::new(None, false));
    }

    let record = port_file
        .read_current()
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let running = match record {
        Some(record) => {
            let probe = TcpStream::connect(record.addr());
            matches!(
                tokio::time::timeout(ServerConfig::PROBE_TIMEOUT, probe).await,
                Ok(Ok(_))
            )
        }
        None => false,
    };
    Ok(Status::new(record, running))
}
