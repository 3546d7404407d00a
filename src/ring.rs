//! Bounded in-memory buffer of recent entries for live observation.
//!
//! The ring keeps the newest `capacity` entries and a monotonic version
//! counter so observers (the TUI data feed) can detect changes cheaply and
//! take by-value snapshots without holding the lock.

use std::sync::Mutex;

use crate::entry::LogEntry;

/// Capacity used when the caller asks for zero.
const DEFAULT_CAPACITY: usize = 10_000;

/// Fixed-capacity circular buffer with overwrite-oldest semantics.
pub struct LogRing {
    inner: Mutex<RingState>,
    capacity: usize,
}

struct RingState {
    buf: Vec<Option<LogEntry>>,
    /// Next write position.
    head: usize,
    /// Number of live entries (<= capacity).
    len: usize,
    /// Incremented on every push; never reset.
    version: u64,
}

impl LogRing {
    /// Create a ring holding up to `capacity` entries (0 selects the
    /// default of 10 000).
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        Self {
            inner: Mutex::new(RingState {
                buf: vec![None; capacity],
                head: 0,
                len: 0,
                version: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, overwriting the oldest when full.
    pub fn push(&self, entry: LogEntry) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        let head = state.head;
        state.buf[head] = Some(entry);
        state.head = (head + 1) % self.capacity;
        if state.len < self.capacity {
            state.len += 1;
        }
        state.version += 1;
    }

    /// The change-detection counter: increments on every push.
    pub fn version(&self) -> u64 {
        self.inner.lock().map(|s| s.version).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|s| s.len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in insertion order, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.snapshot_filtered(|_| true)
    }

    /// Entries in insertion order restricted to those matching `pred`.
    pub fn snapshot_filtered<F>(&self, pred: F) -> Vec<LogEntry>
    where
        F: Fn(&LogEntry) -> bool,
    {
        let Ok(state) = self.inner.lock() else {
            return Vec::new();
        };
        let start = (state.head + self.capacity - state.len) % self.capacity;
        let mut out = Vec::with_capacity(state.len);
        for i in 0..state.len {
            let idx = (start + i) % self.capacity;
            if let Some(entry) = &state.buf[idx] {
                if pred(entry) {
                    out.push(entry.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn entry(msg: &str) -> LogEntry {
        LogEntry::new(Utc::now(), BTreeMap::new(), msg.to_string())
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let ring = LogRing::new(0);
        assert_eq!(ring.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_snapshot_length_and_order() {
        let ring = LogRing::new(3);
        for i in 0..2 {
            ring.push(entry(&format!("m{i}")));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].msg, "m0");
        assert_eq!(snap[1].msg, "m1");
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(entry(&format!("m{i}")));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 3);
        let msgs: Vec<_> = snap.iter().map(|e| e.msg.as_str()).collect();
        assert_eq!(msgs, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_version_is_monotonic() {
        let ring = LogRing::new(2);
        let v0 = ring.version();
        ring.push(entry("a"));
        let v1 = ring.version();
        ring.push(entry("b"));
        ring.push(entry("c"));
        let v3 = ring.version();
        assert!(v0 < v1 && v1 < v3);
        assert_eq!(v3, 3);
    }

    #[test]
    fn test_snapshot_filtered() {
        let ring = LogRing::new(10);
        for i in 0..6 {
            ring.push(entry(&format!("m{i}")));
        }
        let evens = ring.snapshot_filtered(|e| {
            e.msg
                .trim_start_matches('m')
                .parse::<u32>()
                .map(|n| n % 2 == 0)
                .unwrap_or(false)
        });
        assert_eq!(evens.len(), 3);
    }
}
