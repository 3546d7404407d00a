//! The log entry record shared across the capture pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single log line with its labels.
///
/// Labels are ordered (BTreeMap) so serialized entries and talker-name
/// fallbacks are deterministic regardless of ingest order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry timestamp. Stamped with the receive time when the sender
    /// omitted it.
    pub ts: DateTime<Utc>,
    /// Arbitrary labels carried alongside the message.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// The log message, post-redaction once it passes the receiver.
    pub msg: String,
}

impl LogEntry {
    pub fn new(ts: DateTime<Utc>, labels: BTreeMap<String, String>, msg: String) -> Self {
        Self { ts, labels, msg }
    }
}

/// Resolve the talker name for a label set: the `app` label is privileged,
/// with fallback to the first label value in key order.
pub fn talker_name(labels: &BTreeMap<String, String>) -> Option<&str> {
    if let Some(app) = labels.get("app") {
        return Some(app.as_str());
    }
    labels.values().next().map(|v| v.as_str())
}
