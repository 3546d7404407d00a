//! Capture-directory index and session metadata.
//!
//! `index.jsonl` carries one record per closed data file, appended as a
//! single line after the file is fully written (and compressed, when
//! enabled). The append-only line-delimited format is the crash-safety
//! story: a torn trailing line is tolerated by readers, and a data file
//! without an index record is recoverable but unindexed.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the index file inside a capture directory.
pub const INDEX_FILE: &str = "index.jsonl";

/// Name of the session metadata file inside a capture directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Name of the optional audit file inside a capture directory.
pub const AUDIT_FILE: &str = "audit.jsonl";

/// Capture format version written into `metadata.json`.
const METADATA_VERSION: u32 = 1;

/// One record per closed data file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexRecord {
    /// Data file name relative to the capture directory.
    pub file: String,
    /// Earliest entry timestamp in the file.
    pub from: DateTime<Utc>,
    /// Latest entry timestamp in the file.
    pub to: DateTime<Utc>,
    /// Number of entries in the file.
    pub lines: u64,
    /// On-disk size of the file when it was closed.
    pub bytes: u64,
    /// `labels[k][v]` counts the entries whose label `k` had value `v`.
    #[serde(default)]
    pub labels: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Append one record to `index.jsonl` as a single line.
pub fn append_record(dir: &Path, record: &IndexRecord) -> io::Result<()> {
    let line = serde_json::to_vec(record).map_err(invalid_data)?;
    let path = dir.join(INDEX_FILE);
    let existed = path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    if !existed {
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o640));
    }
    file.write_all(&line)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Load every parseable index record. A torn trailing line (crash during
/// append) is skipped rather than treated as corruption.
pub fn load_index(dir: &Path) -> io::Result<Vec<IndexRecord>> {
    let path = dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(&path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IndexRecord>(&line) {
            Ok(rec) => records.push(rec),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable index line");
            }
        }
    }
    Ok(records)
}

/// Rewrite `index.jsonl` with exactly `records`, atomically.
pub fn rewrite_index(dir: &Path, records: &[IndexRecord]) -> io::Result<()> {
    let tmp = dir.join("index.jsonl.tmp");
    {
        let mut file = File::create(&tmp)?;
        for record in records {
            let line = serde_json::to_vec(record).map_err(invalid_data)?;
            file.write_all(&line)?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
    }
    let path = dir.join(INDEX_FILE);
    fs::rename(&tmp, &path)?;
    let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o640));
    Ok(())
}

/// Redaction summary recorded in the metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedactionMetadata {
    pub enabled: bool,
    pub patterns: Vec<String>,
}

/// Session-level capture metadata (`metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureMetadata {
    pub version: u32,
    pub format: String,
    pub started: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<DateTime<Utc>>,
    pub total_lines: u64,
    pub total_bytes: u64,
    pub labels_seen: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redaction: Option<RedactionMetadata>,
}

impl CaptureMetadata {
    pub fn new(started: DateTime<Utc>) -> Self {
        Self {
            version: METADATA_VERSION,
            format: "jsonl".to_string(),
            started,
            stopped: None,
            total_lines: 0,
            total_bytes: 0,
            labels_seen: Vec::new(),
            redaction: None,
        }
    }

    pub fn load(dir: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(dir.join(METADATA_FILE))?;
        serde_json::from_str(&content).map_err(invalid_data)
    }

    /// Write the metadata atomically with owner-only permissions.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(invalid_data)?;
        let tmp = dir.join("metadata.json.tmp");
        fs::write(&tmp, &json)?;
        let path = dir.join(METADATA_FILE);
        fs::rename(&tmp, &path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str, lines: u64) -> IndexRecord {
        IndexRecord {
            file: name.to_string(),
            from: Utc::now(),
            to: Utc::now(),
            lines,
            bytes: lines * 10,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_append_and_load() {
        let tmp = TempDir::new().unwrap();
        append_record(tmp.path(), &record("a.jsonl", 1)).unwrap();
        append_record(tmp.path(), &record("b.jsonl", 2)).unwrap();

        let records = load_index(tmp.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file, "a.jsonl");
        assert_eq!(records[1].lines, 2);
    }

    #[test]
    fn test_load_missing_index_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_index(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_load_tolerates_torn_trailing_line() {
        let tmp = TempDir::new().unwrap();
        append_record(tmp.path(), &record("a.jsonl", 1)).unwrap();
        // Simulate a crash mid-append.
        let mut f = OpenOptions::new()
            .append(true)
            .open(tmp.path().join(INDEX_FILE))
            .unwrap();
        f.write_all(b"{\"file\":\"b.js").unwrap();

        let records = load_index(tmp.path()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_rewrite_index() {
        let tmp = TempDir::new().unwrap();
        append_record(tmp.path(), &record("a.jsonl", 1)).unwrap();
        append_record(tmp.path(), &record("b.jsonl", 2)).unwrap();

        let kept: Vec<_> = load_index(tmp.path())
            .unwrap()
            .into_iter()
            .filter(|r| r.file != "a.jsonl")
            .collect();
        rewrite_index(tmp.path(), &kept).unwrap();

        let records = load_index(tmp.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file, "b.jsonl");
    }

    #[test]
    fn test_metadata_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut meta = CaptureMetadata::new(Utc::now());
        meta.total_lines = 42;
        meta.redaction = Some(RedactionMetadata {
            enabled: true,
            patterns: vec!["credit_card".into()],
        });
        meta.save(tmp.path()).unwrap();

        let loaded = CaptureMetadata::load(tmp.path()).unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded.format, "jsonl");

        let mode = fs::metadata(tmp.path().join(METADATA_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
