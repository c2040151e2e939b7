//! Operation audit logging.
//!
//! When enabled, operation boundaries are appended as JSON lines to the
//! configured file by a dedicated writer task. Recording never blocks a
//! request, and write failures are logged rather than surfaced.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl AuditRecord {
    pub fn new(event_type: &'static str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            client_ip: None,
            stack_name: None,
            operation_id: None,
            command: None,
            success: None,
            failure_reason: None,
            duration_ms: None,
        }
    }
}

#[derive(Debug)]
pub struct AuditLogger {
    tx: Option<mpsc::UnboundedSender<AuditRecord>>,
}

impl AuditLogger {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawn the writer task appending to `path`, creating parent
    /// directories as needed.
    pub fn new(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    error!("cannot create audit log directory {parent:?}: {e}");
                    return;
                }
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    error!("cannot open audit log {path:?}: {e}");
                    return;
                }
            };
            info!(path = %path.display(), "audit logging enabled");

            while let Some(record) = rx.recv().await {
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("failed to encode audit record: {e}");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    warn!("failed to write audit record: {e}");
                }
            }
        });
        Self { tx: Some(tx) }
    }

    pub fn record(&self, record: AuditRecord) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(record);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/audit.jsonl");
        let logger = AuditLogger::new(path.clone());

        let mut record = AuditRecord::new("operation_started");
        record.stack_name = Some("web".to_string());
        record.operation_id = Some("op-1".to_string());
        record.command = Some("up".to_string());
        logger.record(record);

        let mut record = AuditRecord::new("operation_completed");
        record.operation_id = Some("op-1".to_string());
        record.success = Some(true);
        logger.record(record);

        // Writer task is async; poll briefly for both lines.
        let mut content = String::new();
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if content.lines().count() == 2 {
                break;
            }
        }

        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_type"], "operation_started");
        assert_eq!(first["stack_name"], "web");
        // Absent optionals are omitted entirely.
        assert!(first.get("failure_reason").is_none());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["success"], true);
    }

    #[test]
    fn disabled_logger_drops_records() {
        let logger = AuditLogger::disabled();
        assert!(!logger.is_enabled());
        logger.record(AuditRecord::new("operation_started"));
    }
}
