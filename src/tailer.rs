//! Follow the active data file of a capture directory across rotations.
//!
//! The tailer is stateless on disk: it remembers a path and byte offset,
//! reopens the file on every call, and hops to a newer data file when one
//! appears. Compressed (`.zst`) and bookkeeping files are never tailed;
//! malformed JSON lines are skipped silently.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::entry::LogEntry;
use crate::index::{AUDIT_FILE, INDEX_FILE};

/// Incremental reader over the newest plain data file.
pub struct Tailer {
    dir: PathBuf,
    path: Option<PathBuf>,
    offset: u64,
}

impl Tailer {
    /// Start tailing at the end of the newest data file; only lines
    /// written after construction are returned.
    pub fn new(dir: &Path) -> io::Result<Self> {
        let path = newest_data_file(dir)?;
        let offset = match &path {
            Some(p) => fs::metadata(p)?.len(),
            None => 0,
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            path,
            offset,
        })
    }

    /// Start tailing from the beginning of the newest data file.
    pub fn new_from_start(dir: &Path) -> io::Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            path: newest_data_file(dir)?,
            offset: 0,
        })
    }

    /// Return every complete line written since the last call, following
    /// a rotation to a newer file transparently.
    pub fn tail(&mut self) -> io::Result<Vec<LogEntry>> {
        let mut entries = Vec::new();

        // Drain what remains of the current file. It may have been
        // deleted or compressed away since the last call.
        if let Some(path) = self.path.clone() {
            match self.read_from(&path) {
                Ok(mut batch) => entries.append(&mut batch),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        // Hop to a newer file when one exists.
        let newest = newest_data_file(&self.dir)?;
        if let Some(newest) = newest {
            if self.path.as_ref() != Some(&newest) {
                self.path = Some(newest.clone());
                self.offset = 0;
                entries.append(&mut self.read_from(&newest)?);
            }
        }

        Ok(entries)
    }

    /// The last `n` entries of the current file; the tail position is
    /// unaffected.
    pub fn read_last(&self, n: usize) -> io::Result<Vec<LogEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let content = fs::read_to_string(path)?;
        let mut entries: Vec<LogEntry> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if entries.len() > n {
            entries.drain(..entries.len() - n);
        }
        Ok(entries)
    }

    /// Read complete (newline-terminated) lines from the remembered
    /// offset and advance it past the last complete line.
    fn read_from(&mut self, path: &Path) -> io::Result<Vec<LogEntry>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &buf[..=last_newline];
        self.offset += complete.len() as u64;

        let entries = complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_slice(line).ok())
            .collect();
        Ok(entries)
    }
}

/// The most recently modified plain `.jsonl` data file, if any.
fn newest_data_file(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<(PathBuf, SystemTime)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == INDEX_FILE || name == AUDIT_FILE || !name.ends_with(".jsonl") {
            continue;
        }
        let modified = meta.modified()?;
        let is_newer = newest
            .as_ref()
            .map(|(_, best)| modified > *best)
            .unwrap_or(true);
        if is_newer {
            newest = Some((entry.path(), modified));
        }
    }
    Ok(newest.map(|(path, _)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_line(path: &Path, msg: &str) {
        let entry = LogEntry::new(Utc::now(), BTreeMap::new(), msg.to_string());
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        serde_json::to_writer(&mut file, &entry).unwrap();
        file.write_all(b"\n").unwrap();
    }

    #[test]
    fn test_new_skips_existing_content() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("2026-01-01T000000-000.jsonl");
        write_line(&data, "old");

        let mut tailer = Tailer::new(tmp.path()).unwrap();
        assert!(tailer.tail().unwrap().is_empty());

        write_line(&data, "new");
        let batch = tailer.tail().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].msg, "new");
    }

    #[test]
    fn test_from_start_reads_everything() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("2026-01-01T000000-000.jsonl");
        write_line(&data, "a");
        write_line(&data, "b");

        let mut tailer = Tailer::new_from_start(tmp.path()).unwrap();
        let batch = tailer.tail().unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_switches_to_newer_file() {
        let tmp = TempDir::new().unwrap();
        let first = tmp.path().join("2026-01-01T000000-000.jsonl");
        write_line(&first, "a");
        let mut tailer = Tailer::new_from_start(tmp.path()).unwrap();
        assert_eq!(tailer.tail().unwrap().len(), 1);

        // A rotation opens a new file with a later modtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = tmp.path().join("2026-01-01T000000-001.jsonl");
        write_line(&first, "b");
        write_line(&second, "c");

        let batch = tailer.tail().unwrap();
        let msgs: Vec<_> = batch.iter().map(|e| e.msg.as_str()).collect();
        assert_eq!(msgs, vec!["b", "c"]);
    }

    #[test]
    fn test_ignores_bookkeeping_and_compressed_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(INDEX_FILE), "{}\n").unwrap();
        fs::write(tmp.path().join(AUDIT_FILE), "{}\n").unwrap();
        fs::write(tmp.path().join("2026-01-01T000000-000.jsonl.zst"), "x").unwrap();
        let data = tmp.path().join("2026-01-01T000001-000.jsonl");
        write_line(&data, "a");

        let mut tailer = Tailer::new_from_start(tmp.path()).unwrap();
        let batch = tailer.tail().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_skips_malformed_and_partial_lines() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("2026-01-01T000000-000.jsonl");
        write_line(&data, "good");
        let mut file = fs::OpenOptions::new().append(true).open(&data).unwrap();
        file.write_all(b"not json\n{\"ts\":\"trunc").unwrap();

        let mut tailer = Tailer::new_from_start(tmp.path()).unwrap();
        let batch = tailer.tail().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].msg, "good");
    }

    #[test]
    fn test_read_last_preserves_position() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("2026-01-01T000000-000.jsonl");
        for i in 0..5 {
            write_line(&data, &format!("m{i}"));
        }
        let mut tailer = Tailer::new_from_start(tmp.path()).unwrap();

        let last = tailer.read_last(2).unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[1].msg, "m4");

        // The tail position was not consumed by read_last.
        assert_eq!(tailer.tail().unwrap().len(), 5);
    }

    #[test]
    fn test_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let mut tailer = Tailer::new(tmp.path()).unwrap();
        assert!(tailer.tail().unwrap().is_empty());
        assert!(tailer.read_last(3).unwrap().is_empty());
    }
}
