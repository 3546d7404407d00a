//! Concurrent pipeline counters and top-talker aggregation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::entry::talker_name;

/// Shared counters updated from the ingest hot path.
///
/// Counters use atomics; only the talkers map takes a lock. Snapshots are
/// point-in-time copies so observers never hold pipeline state.
#[derive(Default)]
pub struct Stats {
    logs_received: AtomicU64,
    logs_dropped: AtomicU64,
    active_conns: AtomicI64,
    talkers: Mutex<HashMap<String, u64>>,
    labels_seen: Mutex<BTreeSet<String>>,
}

/// One log source aggregated by its talker name.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Talker {
    pub name: String,
    pub count: u64,
}

/// Point-in-time view of the pipeline, taken under the stats lock and
/// sorted by talker count descending.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub logs_received: u64,
    pub logs_dropped: u64,
    pub active_conns: i64,
    pub disk_usage: u64,
    pub disk_cap: u64,
    pub bytes_written: u64,
    pub talkers: Vec<Talker>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one accepted entry: bumps the received counter and the
    /// talker keyed by the `app` label (first label value as fallback).
    pub fn record_entry(&self, labels: &BTreeMap<String, String>) {
        self.logs_received.fetch_add(1, Ordering::Relaxed);
        if !labels.is_empty() {
            if let Ok(mut seen) = self.labels_seen.lock() {
                for k in labels.keys() {
                    if !seen.contains(k) {
                        seen.insert(k.clone());
                    }
                }
            }
        }
        let Some(name) = talker_name(labels) else {
            return;
        };
        if name.is_empty() {
            return;
        }
        if let Ok(mut talkers) = self.talkers.lock() {
            *talkers.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_dropped(&self) {
        self.logs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_opened(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn logs_received(&self) -> u64 {
        self.logs_received.load(Ordering::Relaxed)
    }

    pub fn logs_dropped(&self) -> u64 {
        self.logs_dropped.load(Ordering::Relaxed)
    }

    /// Label keys observed since startup, in sorted order.
    pub fn labels_seen(&self) -> Vec<String> {
        self.labels_seen
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take a snapshot, merging in the writer/rotator figures the stats
    /// object does not own.
    pub fn snapshot(&self, disk_usage: u64, disk_cap: u64, bytes_written: u64) -> StatsSnapshot {
        let mut talkers: Vec<Talker> = self
            .talkers
            .lock()
            .map(|m| {
                m.iter()
                    .map(|(name, count)| Talker {
                        name: name.clone(),
                        count: *count,
                    })
                    .collect()
            })
            .unwrap_or_default();
        talkers.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

        StatsSnapshot {
            logs_received: self.logs_received.load(Ordering::Relaxed),
            logs_dropped: self.logs_dropped.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
            disk_usage,
            disk_cap,
            bytes_written,
            talkers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_record_entry_counts_talkers() {
        let stats = Stats::new();
        stats.record_entry(&labels(&[("app", "api")]));
        stats.record_entry(&labels(&[("app", "api")]));
        stats.record_entry(&labels(&[("app", "web")]));

        let snap = stats.snapshot(0, 0, 0);
        assert_eq!(snap.logs_received, 3);
        assert_eq!(snap.talkers[0], Talker { name: "api".into(), count: 2 });
        assert_eq!(snap.talkers[1], Talker { name: "web".into(), count: 1 });
    }

    #[test]
    fn test_talker_fallback_and_empty() {
        let stats = Stats::new();
        stats.record_entry(&labels(&[("pod", "api-1")]));
        stats.record_entry(&BTreeMap::new());

        let snap = stats.snapshot(0, 0, 0);
        assert_eq!(snap.logs_received, 2);
        assert_eq!(snap.talkers.len(), 1);
        assert_eq!(snap.talkers[0].name, "api-1");
    }

    #[test]
    fn test_snapshot_carries_external_figures() {
        let stats = Stats::new();
        stats.record_dropped();
        stats.conn_opened();

        let snap = stats.snapshot(512, 1024, 2048);
        assert_eq!(snap.logs_dropped, 1);
        assert_eq!(snap.active_conns, 1);
        assert_eq!(snap.disk_usage, 512);
        assert_eq!(snap.disk_cap, 1024);
        assert_eq!(snap.bytes_written, 2048);
    }

    #[test]
    fn test_labels_seen_sorted() {
        let stats = Stats::new();
        stats.record_entry(&labels(&[("zone", "eu"), ("app", "api")]));
        assert_eq!(stats.labels_seen(), vec!["app", "zone"]);
    }
}
