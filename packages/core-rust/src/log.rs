//! Numeric log-level taxonomy and the sink every component reports to.
//!
//! Components never write log files themselves. They hand each outcome to a
//! [`LogSink`] with a location (`"Component:operation"`), a [`LogLevel`], a
//! message, and optional structured values. [`TracingLogSink`] forwards to
//! `tracing`; [`MemoryLogSink`] keeps records for assertions.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity on the fixed numeric scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    ClientFault,
    ServerFault,
    Critical,
    Fatal,
}

impl LogLevel {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Debug => 100,
            Self::Info => 200,
            Self::Notice => 250,
            Self::Warning => 300,
            Self::ClientFault => 400,
            Self::ServerFault => 500,
            Self::Critical => 550,
            Self::Fatal => 600,
        }
    }

    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            100 => Self::Debug,
            200 => Self::Info,
            250 => Self::Notice,
            300 => Self::Warning,
            400 => Self::ClientFault,
            500 => Self::ServerFault,
            550 => Self::Critical,
            600 => Self::Fatal,
            _ => return None,
        })
    }
}

impl From<LogLevel> for u16 {
    fn from(level: LogLevel) -> Self {
        level.code()
    }
}

impl TryFrom<u16> for LogLevel {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown log level code {code}"))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Destination for component log entries.
pub trait LogSink: Send + Sync {
    fn log(
        &self,
        location: &str,
        level: LogLevel,
        message: &str,
        values: Option<&Value>,
        log_type: Option<&str>,
    );

    /// Shorthand for an entry without values or type.
    fn note(&self, location: &str, level: LogLevel, message: &str) {
        self.log(location, level, message, None, None);
    }
}

/// Forwards entries to `tracing`, mapping the numeric scale onto its levels.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(
        &self,
        location: &str,
        level: LogLevel,
        message: &str,
        values: Option<&Value>,
        log_type: Option<&str>,
    ) {
        let code = level.code();
        let log_type = log_type.unwrap_or("sys");
        let values = values.map(ToString::to_string).unwrap_or_default();
        match level {
            LogLevel::Debug => {
                tracing::debug!(location, code, log_type, values = %values, "{message}");
            }
            LogLevel::Info | LogLevel::Notice => {
                tracing::info!(location, code, log_type, values = %values, "{message}");
            }
            LogLevel::Warning | LogLevel::ClientFault => {
                tracing::warn!(location, code, log_type, values = %values, "{message}");
            }
            LogLevel::ServerFault | LogLevel::Critical | LogLevel::Fatal => {
                tracing::error!(location, code, log_type, values = %values, "{message}");
            }
        }
    }
}

/// A captured log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub location: String,
    pub level: LogLevel,
    pub message: String,
    pub values: Option<Value>,
    pub log_type: Option<String>,
}

/// In-memory sink used by tests to assert on what was reported.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records at `level` whose message contains `needle`.
    #[must_use]
    pub fn matching(&self, level: LogLevel, needle: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level && r.message.contains(needle))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.records.lock().iter().any(|r| r.message.contains(needle))
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for MemoryLogSink {
    fn log(
        &self,
        location: &str,
        level: LogLevel,
        message: &str,
        values: Option<&Value>,
        log_type: Option<&str>,
    ) {
        self.records.lock().push(LogRecord {
            location: location.to_string(),
            level,
            message: message.to_string(),
            values: values.cloned(),
            log_type: log_type.map(str::to_string),
        });
    }
}
