//! Destinations for log lines received from a build server.

use super::line::LogLevel;

/// Receives each log line of a response as it arrives.
pub trait LogSink {
    fn log(&mut self, level: LogLevel, content: &str);
}

impl<F> LogSink for F
where
    F: FnMut(LogLevel, &str),
{
    fn log(&mut self, level: LogLevel, content: &str) {
        self(level, content)
    }
}

/// Re-emits server log lines through `tracing`, prefixed with `[server]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&mut self, level: LogLevel, content: &str) {
        match level {
            LogLevel::Error => tracing::error!("[server] {}", content),
            LogLevel::Warn => tracing::warn!("[server] {}", content),
            LogLevel::Info => tracing::info!("[server] {}", content),
            LogLevel::Debug => tracing::debug!("[server] {}", content),
            LogLevel::Trace => tracing::trace!("[server] {}", content),
        }
    }
}
