//! Per-plugin log entries captured from subprocess output and lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a captured log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Best-effort severity classification for a raw stderr line.
    ///
    /// MCP servers have no common log format; this only looks for the usual
    /// severity markers and defaults to `Info`.
    pub fn classify(line: &str) -> Self {
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("fatal") || lower.contains("panic") {
            Self::Error
        } else if lower.contains("warn") {
            Self::Warning
        } else if lower.contains("debug") || lower.contains("trace") {
            Self::Debug
        } else {
            Self::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a log entry originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogSource {
    Stdout,
    Stderr,
    System,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

/// One captured log line for a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: LogSource, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source,
            message: message.into(),
        }
    }

    /// A stderr line with severity inferred from its content.
    pub fn from_stderr_line(line: impl Into<String>) -> Self {
        let message = line.into();
        Self::new(LogLevel::classify(&message), LogSource::Stderr, message)
    }

    /// Renders `[timestamp] [level] [source] message` for display surfaces.
    pub fn format(&self) -> String {
        format!(
            "[{}] [{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level.as_str(),
            self.source.as_str(),
            self.message
        )
    }
}
