//! Append-only audit trail for plugin lifecycle events.
//!
//! Entries are written as one JSON object per line so the file can be
//! tailed and filtered with standard tools. Values under credential-like
//! keys are redacted before they ever reach disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::types::LogError;

const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_AGE_DAYS: u64 = 7;

/// Metadata keys whose values are never written in the clear.
const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "auth",
    "bearer",
    "token",
    "access_token",
    "id_token",
    "secret",
    "password",
    "credential",
    "api_key",
    "apikey",
    "x-api-key",
    "cookie",
    "set-cookie",
];

/// Audited lifecycle actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditAction {
    /// Plugin client was started.
    Start,
    /// Plugin client was stopped.
    Stop,
    /// Plugin instance was disposed.
    Dispose,
    /// A native package version was loaded.
    PackageLoad,
    /// Tools were listed for a workflow.
    ToolList,
    /// A tool was invoked.
    ToolInvoke,
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditResult {
    Success,
    Failure,
    Skipped,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub plugin_name: String,
    pub action: AuditAction,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub result: AuditResult,
}

impl AuditEntry {
    pub fn new(
        plugin_name: impl Into<String>,
        action: AuditAction,
        metadata: serde_json::Map<String, serde_json::Value>,
        result: AuditResult,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            plugin_name: plugin_name.into(),
            action,
            metadata,
            result,
        }
    }

    pub fn plugin_start(plugin_name: impl Into<String>, version: &str) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("version".to_string(), version.into());
        Self::new(plugin_name, AuditAction::Start, metadata, AuditResult::Success)
    }

    pub fn plugin_stop(plugin_name: impl Into<String>, version: &str, result: AuditResult) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("version".to_string(), version.into());
        Self::new(plugin_name, AuditAction::Stop, metadata, result)
    }

    pub fn package_load(plugin_name: impl Into<String>, version: &str, result: AuditResult) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("version".to_string(), version.into());
        Self::new(plugin_name, AuditAction::PackageLoad, metadata, result)
    }

    pub fn tool_list(plugin_name: impl Into<String>, workflow_id: &str, count: usize) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("workflow".to_string(), workflow_id.into());
        metadata.insert("toolCount".to_string(), count.into());
        Self::new(plugin_name, AuditAction::ToolList, metadata, AuditResult::Success)
    }
}

/// JSONL audit sink with size- and age-based rotation.
#[derive(Debug)]
pub struct AuditLogger {
    log_path: PathBuf,
    max_size: u64,
    max_age_days: u64,
}

impl AuditLogger {
    /// Audit logger at the default path, creating parent directories.
    pub fn new() -> Result<Self, LogError> {
        let log_path = default_audit_log_path();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            log_path,
            max_size: DEFAULT_MAX_SIZE,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
        })
    }

    pub fn with_settings(log_path: PathBuf, max_size: u64, max_age_days: u64) -> Self {
        Self {
            log_path,
            max_size,
            max_age_days,
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Appends one redacted entry, rotating the file first if needed.
    pub async fn log(&self, entry: AuditEntry) -> Result<(), LogError> {
        if self.should_rotate().await? {
            self.rotate_log().await?;
        }

        let redacted = redact_entry(entry);
        let line = serde_json::to_string(&redacted)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        // The trail can name plugins and workflows; keep it owner-only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.log_path, permissions).await?;
        }

        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;

        debug!(
            plugin = %redacted.plugin_name,
            action = ?redacted.action,
            result = ?redacted.result,
            "audit entry recorded"
        );
        Ok(())
    }

    async fn should_rotate(&self) -> Result<bool, LogError> {
        if !self.log_path.exists() {
            return Ok(false);
        }

        let metadata = tokio::fs::metadata(&self.log_path).await?;
        if metadata.len() > self.max_size {
            return Ok(true);
        }

        let modified = metadata.modified()?;
        let age = std::time::SystemTime::now()
            .duration_since(modified)
            .map_err(|err| LogError::Io(std::io::Error::other(err)))?;
        Ok(age.as_secs() > self.max_age_days * 24 * 60 * 60)
    }

    async fn rotate_log(&self) -> Result<(), LogError> {
        if !self.log_path.exists() {
            return Ok(());
        }
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rotated_path = self.log_path.with_extension(format!("{timestamp}.jsonl"));
        tokio::fs::rename(&self.log_path, &rotated_path).await?;
        debug!(
            from = %self.log_path.display(),
            to = %rotated_path.display(),
            "rotated audit log"
        );
        Ok(())
    }

    /// The last `count` entries in chronological order. Unparseable lines
    /// are skipped.
    pub async fn read_recent(&self, count: usize) -> Result<Vec<AuditEntry>, LogError> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.log_path).await?;
        let mut entries: Vec<AuditEntry> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        entries.reverse();
        Ok(entries)
    }
}

/// The audit trail lives next to the catalog under the host config dir.
pub fn default_audit_log_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("berth")
        .join("audit.jsonl")
}

fn redact_entry(mut entry: AuditEntry) -> AuditEntry {
    let metadata = std::mem::take(&mut entry.metadata);
    entry.metadata = metadata
        .into_iter()
        .map(|(key, value)| {
            if is_sensitive_key(&key) {
                (key, serde_json::Value::String("[redacted]".to_string()))
            } else {
                (key, redact_value(value))
            }
        })
        .collect();
    entry
}

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.iter().any(|s| key.eq_ignore_ascii_case(s))
}

fn redact_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if is_sensitive_key(&key) {
                        (key, serde_json::Value::String("[redacted]".to_string()))
                    } else {
                        (key, redact_value(value))
                    }
                })
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(redact_value).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn round_trips_entries_through_the_jsonl_file() {
        let dir = TempDir::new().unwrap();
        let logger = AuditLogger::with_settings(dir.path().join("audit.jsonl"), 1024 * 1024, 1);

        logger
            .log(AuditEntry::plugin_start("weather", "1.2.3"))
            .await
            .unwrap();
        logger
            .log(AuditEntry::tool_list("weather", "wf-1", 4))
            .await
            .unwrap();

        let entries = logger.read_recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::Start);
        assert_eq!(entries[1].metadata["toolCount"], json!(4));
    }

    #[tokio::test]
    async fn redacts_credential_metadata_before_writing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_settings(path.clone(), 1024 * 1024, 1);

        let mut metadata = serde_json::Map::new();
        metadata.insert("version".to_string(), json!("1.0.0"));
        metadata.insert("Authorization".to_string(), json!("Bearer hunter2"));
        metadata.insert(
            "transport".to_string(),
            json!({"url": "https://api.example.com", "api_key": "k-123"}),
        );
        logger
            .log(AuditEntry::new(
                "weather",
                AuditAction::Start,
                metadata,
                AuditResult::Success,
            ))
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!raw.contains("hunter2"));
        assert!(!raw.contains("k-123"));
        assert!(raw.contains("[redacted]"));
        assert!(raw.contains("https://api.example.com"));
    }

    #[tokio::test]
    async fn rotates_when_the_file_outgrows_its_ceiling() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_settings(path.clone(), 64, 365);

        for _ in 0..4 {
            logger
                .log(AuditEntry::plugin_start("weather", "1.0.0"))
                .await
                .unwrap();
        }

        let rotated = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path() != path)
            .count();
        assert!(rotated >= 1, "expected at least one rotated file");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn audit_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::with_settings(path.clone(), 1024, 1);
        logger
            .log(AuditEntry::plugin_start("weather", "1.0.0"))
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
