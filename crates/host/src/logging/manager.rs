//! Shared log store for all managed plugins.

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::Mutex;

use crate::logging::audit::{AuditEntry, AuditLogger};
use crate::logging::ring_buffer::LogRingBuffer;
use crate::types::{LogEntry, LogError, LogLevel, LogSource};

const DEFAULT_MAX_LOG_ENTRIES_PER_PLUGIN: usize = 1000;

/// Stores recent log lines per plugin and forwards lifecycle events to the
/// audit trail.
#[derive(Debug)]
pub struct LogManager {
    /// Ring buffers keyed by plugin name.
    buffers: Mutex<HashMap<String, LogRingBuffer>>,
    audit_logger: AuditLogger,
    max_entries_per_plugin: usize,
}

impl LogManager {
    /// Log manager with the default audit sink location.
    pub fn new() -> Result<Self, LogError> {
        Ok(Self::with_audit_logger(AuditLogger::new()?))
    }

    pub fn with_audit_logger(audit_logger: AuditLogger) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            audit_logger,
            max_entries_per_plugin: DEFAULT_MAX_LOG_ENTRIES_PER_PLUGIN,
        }
    }

    /// Buffers one entry for `plugin_name`, creating its buffer on first use.
    pub async fn add_log(&self, plugin_name: &str, entry: LogEntry) {
        let mut buffers = self.buffers.lock().await;
        buffers
            .entry(plugin_name.to_string())
            .or_insert_with(|| LogRingBuffer::new(self.max_entries_per_plugin))
            .add_entry(entry);
    }

    /// Buffers a host-originated lifecycle message.
    pub async fn add_system(&self, plugin_name: &str, level: LogLevel, message: impl Into<String>) {
        self.add_log(plugin_name, LogEntry::new(level, LogSource::System, message))
            .await;
    }

    pub async fn get_recent_logs(&self, plugin_name: &str, count: usize) -> Vec<LogEntry> {
        let buffers = self.buffers.lock().await;
        buffers
            .get(plugin_name)
            .map_or_else(Vec::new, |buffer| buffer.get_recent(count))
    }

    pub async fn get_all_logs(&self, plugin_name: &str) -> Vec<LogEntry> {
        let buffers = self.buffers.lock().await;
        buffers
            .get(plugin_name)
            .map_or_else(Vec::new, LogRingBuffer::get_all)
    }

    pub async fn clear_logs(&self, plugin_name: &str) {
        let mut buffers = self.buffers.lock().await;
        if let Some(buffer) = buffers.get_mut(plugin_name) {
            buffer.clear();
        }
    }

    /// Writes every buffered entry for `plugin_name` to `path`, one
    /// formatted line each.
    pub async fn export_logs(&self, plugin_name: &str, path: &Path) -> Result<(), LogError> {
        let logs = self.get_all_logs(plugin_name).await;
        let mut content = String::new();
        for log in logs {
            content.push_str(&log.format());
            content.push('\n');
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub async fn log_audit(&self, entry: AuditEntry) -> Result<(), LogError> {
        self.audit_logger.log(entry).await
    }

    pub fn audit_logger(&self) -> &AuditLogger {
        &self.audit_logger
    }
}
