//! Capture archiving and cross-service error correlation.
//!
//! `pack`/`unpack` move a whole capture directory through a zstd-compressed
//! tar. Already-compressed `.jsonl.zst` data files are stored as-is; they
//! are never re-encoded individually. `correlate` mines an unpacked (or
//! live) capture for error cascades between services.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;

use regex::Regex;

use crate::entry::{talker_name, LogEntry};
use crate::index::{CaptureMetadata, INDEX_FILE, METADATA_FILE};

/// Compression level for the outer archive stream.
const ZSTD_LEVEL: i32 = 3;

/// Minimum confidence for a correlation to be reported.
const MIN_CONFIDENCE: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{0} has no metadata.json; not a capture directory")]
    MissingMetadata(String),
    #[error("unpacked archive is missing {0}")]
    MissingFile(String),
    #[error("unpacked metadata.json is not valid capture metadata: {0}")]
    InvalidMetadata(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Pack every regular file of `src_dir` into a zstd-compressed tar at
/// `archive_path`. Fails when `src_dir` is not a capture directory.
pub fn pack(src_dir: &Path, archive_path: &Path) -> Result<(), ArchiveError> {
    if !src_dir.join(METADATA_FILE).exists() {
        return Err(ArchiveError::MissingMetadata(
            src_dir.display().to_string(),
        ));
    }

    let out = File::create(archive_path)?;
    let encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);

    let mut names: Vec<_> = fs::read_dir(src_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.metadata().map(|m| m.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in names {
        let mut file = File::open(src_dir.join(&name))?;
        builder.append_file(&name, &mut file)?;
    }

    let encoder = builder.into_inner()?;
    let out = encoder.finish()?;
    out.sync_all()?;
    Ok(())
}

/// Unpack an archive produced by [`pack`] into `dst_dir` and validate
/// that the result looks like a capture directory.
pub fn unpack(archive_path: &Path, dst_dir: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(dst_dir)?;
    let file = File::open(archive_path)?;
    let decoder = zstd::stream::Decoder::new(file)?;
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dst_dir)?;

    if !dst_dir.join(METADATA_FILE).exists() {
        return Err(ArchiveError::MissingFile(METADATA_FILE.to_string()));
    }
    CaptureMetadata::load(dst_dir).map_err(ArchiveError::InvalidMetadata)?;
    if !dst_dir.join(INDEX_FILE).exists() {
        return Err(ArchiveError::MissingFile(INDEX_FILE.to_string()));
    }
    Ok(())
}

/// One suspected error cascade between two services.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Correlation {
    pub source: String,
    pub target: String,
    /// Median delay between source and target errors in co-occurring
    /// windows, in seconds.
    pub lag_seconds: f64,
    /// Fraction of the source's error windows that the target echoed.
    pub confidence: f64,
    /// `co_failure`, `cascade_timeout`, or `cascade_generic`.
    pub pattern: String,
    pub source_error: String,
    pub target_error: String,
}

/// Correlate error bursts across services in a capture directory.
///
/// Entries are bucketed into fixed `window`-sized bins by timestamp. A
/// source window co-occurs with a target error in the same or the
/// immediately following window; pairs echoing in at least half of the
/// source's error windows are reported.
pub fn correlate(dir: &Path, window: Duration) -> Result<Vec<Correlation>, ArchiveError> {
    let window_secs = window.as_secs().max(1) as i64;
    let error_re = error_regex();

    // Per service: error windows with the earliest error timestamp in
    // each, plus a representative message.
    let mut services: BTreeMap<String, ServiceErrors> = BTreeMap::new();
    for entry in read_all_entries(dir)? {
        if !error_re.is_match(&entry.msg) {
            continue;
        }
        let Some(name) = talker_name(&entry.labels) else {
            continue;
        };
        let win = entry.ts.timestamp().div_euclid(window_secs);
        let service = services.entry(name.to_string()).or_default();
        let ts = entry.ts.timestamp();
        service
            .windows
            .entry(win)
            .and_modify(|first| *first = (*first).min(ts))
            .or_insert(ts);
        if service.sample.is_empty() {
            service.sample = entry.msg.clone();
        }
    }

    let mut out = Vec::new();
    for (source, source_errors) in &services {
        for (target, target_errors) in &services {
            if source == target {
                continue;
            }
            let mut lags: Vec<f64> = Vec::new();
            for (win, source_first) in &source_errors.windows {
                let echo = target_errors
                    .windows
                    .get(win)
                    .or_else(|| target_errors.windows.get(&(win + 1)));
                if let Some(target_first) = echo {
                    lags.push((*target_first - *source_first) as f64);
                }
            }
            if lags.is_empty() {
                continue;
            }
            let confidence = lags.len() as f64 / source_errors.windows.len() as f64;
            if confidence < MIN_CONFIDENCE {
                continue;
            }
            lags.sort_by(|a, b| a.total_cmp(b));
            let lag = median(&lags);
            if lag < 0.0 {
                // The reverse pair reports this cascade.
                continue;
            }
            let pattern = if lag < window_secs as f64 {
                "co_failure"
            } else if source_errors
                .sample
                .to_lowercase()
                .contains(&target.to_lowercase())
            {
                "cascade_timeout"
            } else {
                "cascade_generic"
            };
            out.push(Correlation {
                source: source.clone(),
                target: target.clone(),
                lag_seconds: lag,
                confidence,
                pattern: pattern.to_string(),
                source_error: source_errors.sample.clone(),
                target_error: target_errors.sample.clone(),
            });
        }
    }
    out.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(out)
}

#[derive(Default)]
struct ServiceErrors {
    /// Window index -> earliest error timestamp (unix seconds) in it.
    windows: BTreeMap<i64, i64>,
    sample: String,
}

fn error_regex() -> Regex {
    // Error-shaped messages; compile-time constant.
    Regex::new(r"(?i)\b(error|fail|failed|failure|exception|timeout|refused|panic)\b")
        .unwrap_or_else(|e| panic!("error regex: {e}"))
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Every parseable entry from the capture's data files, plain or
/// compressed. Malformed lines are skipped.
fn read_all_entries(dir: &Path) -> io::Result<Vec<LogEntry>> {
    let mut names: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.metadata().map(|m| m.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| {
            name != INDEX_FILE
                && name != crate::index::AUDIT_FILE
                && (name.ends_with(".jsonl") || name.ends_with(".jsonl.zst"))
        })
        .collect();
    names.sort();

    let mut entries = Vec::new();
    for name in names {
        let path = dir.join(&name);
        let content = if name.ends_with(".zst") {
            let file = File::open(&path)?;
            let mut decoder = zstd::stream::Decoder::new(file)?;
            let mut buf = Vec::new();
            io::Read::read_to_end(&mut decoder, &mut buf)?;
            buf
        } else {
            fs::read(&path)?
        };
        for line in content.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_slice::<LogEntry>(line) {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}
