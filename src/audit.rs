/// Audit logging for security-critical operations
///
/// This module provides structured logging of every change vmfw makes to
/// the host: table restores, provider refreshes, filter defines and
/// undefines, and snapshot restores.
use crate::core::model::IpFamily;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplyTable,
    RefreshProvider,
    DefineFilter,
    UndefineFilter,
    UnfilterInstance,
    RestoreSnapshot,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Creates an audit log writing to an explicit file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    /// Returns the path to the audit log file
    pub fn path(&self) -> &Path {
        &self.log_path
    }

    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Logs a table restore
pub async fn log_apply_table(
    audit: &AuditLog,
    family: IpFamily,
    rule_count: usize,
    success: bool,
    error: Option<String>,
) {
    audit
        .record(AuditEvent::new(
            EventType::ApplyTable,
            success,
            serde_json::json!({
                "family": family,
                "rule_count": rule_count,
            }),
            error,
        ))
        .await;
}

/// Logs a provider chain refresh
pub async fn log_refresh_provider(audit: &AuditLog, rule_count: usize, success: bool, error: Option<String>) {
    audit
        .record(AuditEvent::new(
            EventType::RefreshProvider,
            success,
            serde_json::json!({ "rule_count": rule_count }),
            error,
        ))
        .await;
}

/// Logs a filter definition
pub async fn log_define_filter(audit: &AuditLog, name: &str, success: bool, error: Option<String>) {
    audit
        .record(AuditEvent::new(
            EventType::DefineFilter,
            success,
            serde_json::json!({ "filter": name }),
            error,
        ))
        .await;
}

/// Logs a filter removal
pub async fn log_undefine_filter(audit: &AuditLog, name: &str, success: bool, error: Option<String>) {
    audit
        .record(AuditEvent::new(
            EventType::UndefineFilter,
            success,
            serde_json::json!({ "filter": name }),
            error,
        ))
        .await;
}

/// Logs removal of an instance's packet-filter chain
pub async fn log_unfilter_instance(
    audit: &AuditLog,
    instance: u64,
    success: bool,
    error: Option<String>,
) {
    audit
        .record(AuditEvent::new(
            EventType::UnfilterInstance,
            success,
            serde_json::json!({ "instance": instance }),
            error,
        ))
        .await;
}

/// Logs a snapshot restore
pub async fn log_restore_snapshot(
    audit: &AuditLog,
    family: IpFamily,
    success: bool,
    error: Option<String>,
) {
    audit
        .record(AuditEvent::new(
            EventType::RestoreSnapshot,
            success,
            serde_json::json!({ "family": family }),
            error,
        ))
        .await;
}
