//! Size-triggered file rotation with compression, crash-safe indexing,
//! and disk-cap enforcement.
//!
//! The rotator exclusively owns the active data file and the index file.
//! One lock serializes `write`, `track_line`, `disk_usage`, and `close`;
//! the critical path is IO-bound and throughput is bought by batching in
//! the writer above, not by finer locking here.
//!
//! Per-file lifecycle: OPEN -> (writes) -> OPEN | ROTATING ->
//! CLOSED(+indexed) -> (if compression) COMPRESSED. The index record is
//! appended only after the data file is fully written and compressed, so
//! a crash in between leaves an unindexed file that tooling treats as
//! recoverable.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::index::{self, IndexRecord, AUDIT_FILE, INDEX_FILE, METADATA_FILE};
use crate::writer::LogSink;

/// Compression level for rotated files.
const ZSTD_LEVEL: i32 = 3;

/// Fraction of the disk cap at which the warning hook fires.
const DISK_WARN_PCT: u64 = 80;

/// Rotation policy for one capture directory.
#[derive(Debug, Clone)]
pub struct RotatorConfig {
    pub dir: PathBuf,
    /// Rotate when the active file would exceed this many bytes.
    pub max_file: u64,
    /// Delete oldest data files when the directory exceeds this many
    /// bytes; 0 disables the cap.
    pub max_disk: u64,
    /// Compress rotated files to `.zst`.
    pub compress: bool,
}

pub type RotateHook = Box<dyn Fn(&str) + Send + Sync>;
pub type ErrorHook = Box<dyn Fn(&io::Error) + Send + Sync>;
pub type DiskWarningHook = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Rotating writer over a capture directory.
pub struct Rotator {
    cfg: RotatorConfig,
    state: Mutex<RotatorState>,
    on_rotate: Option<RotateHook>,
    on_error: Option<ErrorHook>,
    on_disk_warning: Option<DiskWarningHook>,
}

struct RotatorState {
    file: Option<File>,
    file_name: String,
    active_size: u64,
    disk_usage: u64,
    lines: u64,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    labels: BTreeMap<String, BTreeMap<String, u64>>,
    last_stamp: String,
    seq: u32,
    warned: bool,
    rotations: u64,
    closed: bool,
}

impl Rotator {
    /// Open a rotator over `cfg.dir`, seeding the disk-usage figure with
    /// the total size of all regular files already present.
    pub fn new(cfg: RotatorConfig) -> io::Result<Self> {
        fs::create_dir_all(&cfg.dir)?;
        let disk_usage = dir_size(&cfg.dir)?;
        let mut state = RotatorState {
            file: None,
            file_name: String::new(),
            active_size: 0,
            disk_usage,
            lines: 0,
            from: None,
            to: None,
            labels: BTreeMap::new(),
            last_stamp: String::new(),
            seq: 0,
            warned: false,
            rotations: 0,
            closed: false,
        };
        open_data_file(&cfg.dir, &mut state)?;
        Ok(Self {
            cfg,
            state: Mutex::new(state),
            on_rotate: None,
            on_error: None,
            on_disk_warning: None,
        })
    }

    /// Called with the rotation reason after each successful rotation.
    pub fn with_rotate_hook(mut self, hook: RotateHook) -> Self {
        self.on_rotate = Some(hook);
        self
    }

    /// Called with every write/rotation error before it propagates.
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }

    /// Called once per crossing of the disk warning threshold.
    pub fn with_disk_warning_hook(mut self, hook: DiskWarningHook) -> Self {
        self.on_disk_warning = Some(hook);
        self
    }

    /// Append `p` to the active file, rotating first when the write would
    /// push a non-empty file past `max_file`.
    pub fn write(&self, p: &[u8]) -> io::Result<()> {
        let result = self.write_inner(p);
        if let Err(e) = &result {
            if let Some(hook) = &self.on_error {
                hook(e);
            }
        }
        result
    }

    fn write_inner(&self, p: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state)?;
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "rotator is closed"));
        }
        if state.active_size > 0 && state.active_size + p.len() as u64 > self.cfg.max_file {
            self.rotate_locked(&mut state)?;
        }
        if state.file.is_none() {
            // A previous rotation failed after closing the old handle;
            // resume on a fresh file.
            open_data_file(&self.cfg.dir, &mut state)?;
        }
        if let Some(file) = state.file.as_mut() {
            file.write_all(p)?;
        }
        state.active_size += p.len() as u64;
        state.disk_usage += p.len() as u64;
        self.check_disk_warning(&mut state);
        Ok(())
    }

    /// Fold one entry into the per-file index accumulators.
    pub fn track_line(&self, ts: DateTime<Utc>, labels: &BTreeMap<String, String>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.lines += 1;
        state.from = Some(match state.from {
            Some(from) if from <= ts => from,
            _ => ts,
        });
        state.to = Some(match state.to {
            Some(to) if to >= ts => to,
            _ => ts,
        });
        for (k, v) in labels {
            *state
                .labels
                .entry(k.clone())
                .or_default()
                .entry(v.clone())
                .or_insert(0) += 1;
        }
    }

    /// Current directory usage as tracked by the rotator.
    pub fn disk_usage(&self) -> u64 {
        self.state.lock().map(|s| s.disk_usage).unwrap_or(0)
    }

    pub fn disk_cap(&self) -> u64 {
        self.cfg.max_disk
    }

    /// Completed rotations since construction.
    pub fn rotations(&self) -> u64 {
        self.state.lock().map(|s| s.rotations).unwrap_or(0)
    }

    /// Name of the currently open data file.
    pub fn active_file(&self) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.file.is_some().then(|| s.file_name.clone()))
    }

    /// Close the active file, writing a final index record when any lines
    /// were tracked. A second close is a no-op.
    pub fn close(&self) -> io::Result<()> {
        let result = self.close_inner();
        if let Err(e) = &result {
            if let Some(hook) = &self.on_error {
                hook(e);
            }
        }
        result
    }

    fn close_inner(&self) -> io::Result<()> {
        let mut state = lock(&self.state)?;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let Some(mut file) = state.file.take() else {
            return Ok(());
        };
        file.flush()?;
        drop(file);
        if state.lines > 0 {
            let (final_name, final_size) = self.finalize_file(&mut state)?;
            let record = build_record(&mut state, final_name, final_size);
            index::append_record(&self.cfg.dir, &record)?;
        }
        Ok(())
    }

    fn rotate_locked(&self, state: &mut RotatorState) -> io::Result<()> {
        let Some(mut file) = state.file.take() else {
            return Ok(());
        };
        if let Err(e) = file.flush() {
            state.file = Some(file);
            return Err(e);
        }
        drop(file);

        let (final_name, final_size) = self.finalize_file(state)?;
        let record = build_record(state, final_name, final_size);
        index::append_record(&self.cfg.dir, &record)?;
        self.enforce_disk_cap(state)?;
        open_data_file(&self.cfg.dir, state)?;
        state.rotations += 1;
        if let Some(hook) = &self.on_rotate {
            hook("size");
        }
        Ok(())
    }

    /// Optionally compress the just-closed file. Returns the final name
    /// and on-disk size, correcting `disk_usage` when compression shrank
    /// the file. A compression failure reopens the source for append so
    /// the caller can keep writing.
    fn finalize_file(&self, state: &mut RotatorState) -> io::Result<(String, u64)> {
        if !self.cfg.compress || state.active_size == 0 {
            return Ok((state.file_name.clone(), state.active_size));
        }
        let src = self.cfg.dir.join(&state.file_name);
        match compress_file(&src) {
            Ok((name, size)) => {
                state.disk_usage = state
                    .disk_usage
                    .saturating_sub(state.active_size)
                    .saturating_add(size);
                Ok((name, size))
            }
            Err(e) => {
                state.file = Some(OpenOptions::new().append(true).open(&src)?);
                Err(e)
            }
        }
    }

    /// Bring the directory back under `max_disk` by deleting the oldest
    /// data files, then prune their index records.
    fn enforce_disk_cap(&self, state: &mut RotatorState) -> io::Result<()> {
        if self.cfg.max_disk == 0 {
            return Ok(());
        }
        // Recompute from disk truth; the running figure drifts once
        // files are compressed or deleted externally.
        let mut usage = dir_size(&self.cfg.dir)?;
        let mut deleted = Vec::new();
        if usage > self.cfg.max_disk {
            let mut candidates = data_file_names(&self.cfg.dir)?;
            candidates.sort();
            for name in candidates {
                if usage <= self.cfg.max_disk {
                    break;
                }
                let path = self.cfg.dir.join(&name);
                let size = match fs::metadata(&path) {
                    Ok(m) => m.len(),
                    Err(_) => continue,
                };
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(file = %name, error = %e, "Failed to delete data file over disk cap");
                    continue;
                }
                usage = usage.saturating_sub(size);
                deleted.push(name);
            }
            if !deleted.is_empty() {
                tracing::info!(deleted = deleted.len(), usage, cap = self.cfg.max_disk, "Disk cap enforced");
                let kept: Vec<IndexRecord> = index::load_index(&self.cfg.dir)?
                    .into_iter()
                    .filter(|r| !deleted.contains(&r.file))
                    .collect();
                index::rewrite_index(&self.cfg.dir, &kept)?;
                usage = dir_size(&self.cfg.dir)?;
            }
        }
        state.disk_usage = usage;
        Ok(())
    }

    fn check_disk_warning(&self, state: &mut RotatorState) {
        if self.cfg.max_disk == 0 {
            return;
        }
        let over = state.disk_usage * 100 >= self.cfg.max_disk * DISK_WARN_PCT;
        if over && !state.warned {
            state.warned = true;
            if let Some(hook) = &self.on_disk_warning {
                hook(state.disk_usage, self.cfg.max_disk);
            }
        } else if !over {
            state.warned = false;
        }
    }
}

impl LogSink for Rotator {
    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        self.write(line)
    }
}

fn lock(state: &Mutex<RotatorState>) -> io::Result<std::sync::MutexGuard<'_, RotatorState>> {
    state
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "rotator lock poisoned"))
}

/// Open the next data file and reset the per-file accumulators.
///
/// The sequence counter resets when the wall second changes; a leftover
/// file from an earlier run in the same second just bumps the counter.
fn open_data_file(dir: &Path, state: &mut RotatorState) -> io::Result<()> {
    let stamp = Utc::now().format("%Y-%m-%dT%H%M%S").to_string();
    if stamp == state.last_stamp {
        state.seq += 1;
    } else {
        state.last_stamp = stamp.clone();
        state.seq = 0;
    }
    let (name, file) = loop {
        let name = format!("{}-{:03}.jsonl", stamp, state.seq);
        match OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(dir.join(&name))
        {
            Ok(file) => break (name, file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                state.seq += 1;
            }
            Err(e) => return Err(e),
        }
    };
    let _ = fs::set_permissions(dir.join(&name), fs::Permissions::from_mode(0o640));
    state.file = Some(file);
    state.file_name = name;
    state.active_size = 0;
    state.lines = 0;
    state.from = None;
    state.to = None;
    state.labels.clear();
    Ok(())
}

fn build_record(state: &mut RotatorState, file: String, bytes: u64) -> IndexRecord {
    let now = Utc::now();
    IndexRecord {
        file,
        from: state.from.unwrap_or(now),
        to: state.to.unwrap_or(now),
        lines: state.lines,
        bytes,
        labels: std::mem::take(&mut state.labels),
    }
}

/// Stream-compress `src` to `src + ".zst"`, delete the source, and return
/// the compressed file's name and size.
fn compress_file(src: &Path) -> io::Result<(String, u64)> {
    let dst = PathBuf::from(format!("{}.zst", src.display()));
    {
        let mut reader = File::open(src)?;
        let writer = File::create(&dst)?;
        let mut encoder = zstd::stream::Encoder::new(writer, ZSTD_LEVEL)?;
        io::copy(&mut reader, &mut encoder)?;
        let writer = encoder.finish()?;
        writer.sync_all()?;
    }
    fs::remove_file(src)?;
    let size = fs::metadata(&dst)?.len();
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok((name, size))
}

/// Total size of the regular files directly inside `dir`.
fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Data file names (rotated or active), excluding the bookkeeping files.
fn data_file_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.metadata()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == INDEX_FILE || name == METADATA_FILE || name == AUDIT_FILE {
            continue;
        }
        if name.ends_with(".jsonl") || name.ends_with(".jsonl.zst") {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config(dir: &Path, max_file: u64, max_disk: u64, compress: bool) -> RotatorConfig {
        RotatorConfig {
            dir: dir.to_path_buf(),
            max_file,
            max_disk,
            compress,
        }
    }

    fn line(n: usize) -> Vec<u8> {
        let mut l = vec![b'x'; n - 1];
        l.push(b'\n');
        l
    }

    fn labels(app: &str) -> BTreeMap<String, String> {
        [("app".to_string(), app.to_string())].into_iter().collect()
    }

    #[test]
    fn test_rotates_on_size() {
        let tmp = TempDir::new().unwrap();
        let rotator = Rotator::new(config(tmp.path(), 100, 0, false)).unwrap();
        for _ in 0..10 {
            rotator.track_line(Utc::now(), &labels("api"));
            rotator.write(&line(40)).unwrap();
        }
        rotator.close().unwrap();

        let records = index::load_index(tmp.path()).unwrap();
        assert!(records.len() >= 3, "expected several rotations, got {}", records.len());
        for record in &records {
            assert!(tmp.path().join(&record.file).exists(), "{} missing", record.file);
        }
        let total_lines: u64 = records.iter().map(|r| r.lines).sum();
        assert_eq!(total_lines, 10);
    }

    #[test]
    fn test_active_file_not_indexed_until_rotate() {
        let tmp = TempDir::new().unwrap();
        let rotator = Rotator::new(config(tmp.path(), 1024, 0, false)).unwrap();
        rotator.track_line(Utc::now(), &labels("api"));
        rotator.write(&line(20)).unwrap();

        let active = rotator.active_file().unwrap();
        let records = index::load_index(tmp.path()).unwrap();
        assert!(records.iter().all(|r| r.file != active));

        rotator.close().unwrap();
        let records = index::load_index(tmp.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file, active);
    }

    #[test]
    fn test_compression_replaces_source() {
        let tmp = TempDir::new().unwrap();
        let rotator = Rotator::new(config(tmp.path(), 100, 0, true)).unwrap();
        for _ in 0..6 {
            rotator.track_line(Utc::now(), &labels("api"));
            rotator.write(&line(40)).unwrap();
        }
        rotator.close().unwrap();

        let records = index::load_index(tmp.path()).unwrap();
        assert!(!records.is_empty());
        for record in &records {
            assert!(record.file.ends_with(".jsonl.zst"));
            assert!(tmp.path().join(&record.file).exists());
            assert!(!tmp
                .path()
                .join(record.file.trim_end_matches(".zst"))
                .exists());
        }
    }

    #[test]
    fn test_disk_cap_deletes_oldest_and_prunes_index() {
        let tmp = TempDir::new().unwrap();
        let max_disk = 2048;
        let max_file = 256;
        let rotator = Rotator::new(config(tmp.path(), max_file, max_disk, false)).unwrap();
        for _ in 0..100 {
            rotator.track_line(Utc::now(), &labels("api"));
            rotator.write(&line(64)).unwrap();
        }
        rotator.close().unwrap();

        let usage = dir_size(tmp.path()).unwrap();
        // Index lines are small; allow the documented slack.
        assert!(
            usage <= max_disk + max_file + 1024,
            "usage {usage} exceeds cap slack"
        );
        for record in index::load_index(tmp.path()).unwrap() {
            assert!(tmp.path().join(&record.file).exists());
        }
    }

    #[test]
    fn test_disk_warning_fires_once_per_crossing() {
        let tmp = TempDir::new().unwrap();
        let warnings = Arc::new(AtomicU64::new(0));
        let counter = warnings.clone();
        let rotator = Rotator::new(config(tmp.path(), 10_000, 1000, false))
            .unwrap()
            .with_disk_warning_hook(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        // Stay under one file so no rotation resets usage.
        for _ in 0..9 {
            rotator.write(&line(100)).unwrap();
        }
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        rotator.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_write_after_close_fails() {
        let tmp = TempDir::new().unwrap();
        let rotator = Rotator::new(config(tmp.path(), 100, 0, false)).unwrap();
        rotator.track_line(Utc::now(), &labels("api"));
        rotator.write(&line(10)).unwrap();
        rotator.close().unwrap();
        rotator.close().unwrap();
        assert!(rotator.write(&line(10)).is_err());
        assert_eq!(index::load_index(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_track_line_widens_range_and_counts_labels() {
        let tmp = TempDir::new().unwrap();
        let rotator = Rotator::new(config(tmp.path(), 10_000, 0, false)).unwrap();
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(10);
        let t2 = t1 + chrono::Duration::seconds(10);
        rotator.track_line(t1, &labels("api"));
        rotator.track_line(t0, &labels("api"));
        rotator.track_line(t2, &labels("web"));
        rotator.write(&line(10)).unwrap();
        rotator.close().unwrap();

        let records = index::load_index(tmp.path()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.from, t0);
        assert_eq!(record.to, t2);
        assert_eq!(record.lines, 3);
        assert_eq!(record.labels["app"]["api"], 2);
        assert_eq!(record.labels["app"]["web"], 1);
    }

    #[test]
    fn test_seed_disk_usage_from_existing_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("leftover.jsonl"), vec![b'x'; 500]).unwrap();
        let rotator = Rotator::new(config(tmp.path(), 100, 0, false)).unwrap();
        assert!(rotator.disk_usage() >= 500);
        rotator.close().unwrap();
    }

    #[test]
    fn test_rotate_hook_reason() {
        let tmp = TempDir::new().unwrap();
        let reasons = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = reasons.clone();
        let rotator = Rotator::new(config(tmp.path(), 50, 0, false))
            .unwrap()
            .with_rotate_hook(Box::new(move |reason| {
                sink.lock().unwrap().push(reason.to_string());
            }));
        for _ in 0..4 {
            rotator.write(&line(30)).unwrap();
        }
        rotator.close().unwrap();
        let reasons = reasons.lock().unwrap();
        assert!(!reasons.is_empty());
        assert!(reasons.iter().all(|r| r == "size"));
    }
}
