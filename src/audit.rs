//! Append-only JSON-line audit record of server events.
//!
//! Opening the file is the only fallible operation; once open, write
//! failures are ignored so auditing can never stall the ingest path.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::index::AUDIT_FILE;

/// One audited server event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditEvent {
    pub fn named(event: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.to_string(),
            remote_ip: None,
            lines: None,
            bytes: None,
            duration_ms: None,
        }
    }

    /// Summary of one ingest push.
    pub fn push(remote_ip: Option<String>, lines: u64, bytes: u64, duration_ms: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            event: "push".to_string(),
            remote_ip,
            lines: Some(lines),
            bytes: Some(bytes),
            duration_ms: Some(duration_ms),
        }
    }
}

/// Appends events to `audit.jsonl` in the capture directory.
pub struct AuditLogger {
    file: Mutex<fs::File>,
}

impl AuditLogger {
    /// Open (creating if needed) the audit file. Fails if the file cannot
    /// be opened for append.
    pub fn open(dir: &Path) -> io::Result<Self> {
        let path = dir.join(AUDIT_FILE);
        let existed = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !existed {
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o644));
        }
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one event as a single JSON line. Errors are ignored.
    pub fn log(&self, event: &AuditEvent) {
        let Ok(mut line) = serde_json::to_vec(event) else {
            return;
        };
        line.push(b'\n');
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(&line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_and_append() {
        let tmp = TempDir::new().unwrap();
        let audit = AuditLogger::open(tmp.path()).unwrap();
        audit.log(&AuditEvent::named("server_started"));
        audit.log(&AuditEvent::push(Some("10.0.0.9".into()), 3, 120, 5));

        let content = fs::read_to_string(tmp.path().join(AUDIT_FILE)).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("server_started"));
        let push: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(push["event"], "push");
        assert_eq!(push["lines"], 3);
        assert_eq!(push["remote_ip"], "10.0.0.9");
    }

    #[test]
    fn test_open_failure_surfaces() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("no-such-dir");
        assert!(AuditLogger::open(&missing).is_err());
    }

    #[test]
    fn test_named_event_omits_optional_fields() {
        let event = AuditEvent::named("server_stopped");
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("remote_ip"));
        assert!(!json.contains("lines"));
    }
}
