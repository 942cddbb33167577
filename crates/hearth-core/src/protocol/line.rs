//! Tagged response lines, log levels and exit statuses.

use crate::{HearthError, Result};
use std::fmt;

/// Tag of the terminal status line.
pub const RC_TAG: &str = "RC";

/// Severity of a forwarded server log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

const LEVEL_TABLE: [(&str, LogLevel); 5] = [
    ("ERROR", LogLevel::Error),
    ("WARN", LogLevel::Warn),
    ("INFO", LogLevel::Info),
    ("DEBUG", LogLevel::Debug),
    ("TRACE", LogLevel::Trace),
];

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// Look up a wire tag. Tags are case-sensitive.
    pub fn from_tag(tag: &str) -> Option<Self> {
        LEVEL_TABLE
            .iter()
            .find(|(name, _)| *name == tag)
            .map(|(_, level)| *level)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Outcome of a compilation request, carried on the `RC:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileResult {
    Ok,
    Error,
    CmdErr,
    SysErr,
    Abnormal,
}

impl CompileResult {
    pub fn code(&self) -> i32 {
        match self {
            CompileResult::Ok => 0,
            CompileResult::Error => 1,
            CompileResult::CmdErr => 2,
            CompileResult::SysErr => 3,
            CompileResult::Abnormal => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(CompileResult::Ok),
            1 => Some(CompileResult::Error),
            2 => Some(CompileResult::CmdErr),
            3 => Some(CompileResult::SysErr),
            4 => Some(CompileResult::Abnormal),
            _ => None,
        }
    }
}

/// Returned by `read_response` when the stream ends without an `RC:` line.
pub const ERROR_EXIT_CODE: i32 = 1;

/// What a response line asks the reader to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Log(LogLevel),
    ExitCode,
    Unknown,
}

/// One `<tag>:<content>` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolLine<'a> {
    pub tag: &'a str,
    pub content: &'a str,
}

impl<'a> ProtocolLine<'a> {
    /// Split on the first `:`. A line without one is a framing violation.
    pub fn parse(line: &'a str) -> Result<Self> {
        let (tag, content) = line.split_once(':').ok_or_else(|| {
            HearthError::framing(format!("could not parse protocol line: {:?}", line))
        })?;
        Ok(Self { tag, content })
    }

    pub fn kind(&self) -> LineKind {
        if let Some(level) = LogLevel::from_tag(self.tag) {
            LineKind::Log(level)
        } else if self.tag == RC_TAG {
            LineKind::ExitCode
        } else {
            LineKind::Unknown
        }
    }

    /// Parse the content of an `RC:` line.
    pub fn exit_code(&self) -> Result<i32> {
        self.content.trim().parse::<i32>().map_err(|_| {
            HearthError::framing(format!("invalid exit code: {:?}", self.content))
        })
    }
}
