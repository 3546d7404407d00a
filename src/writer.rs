//! Bounded-queue drain from the ingest path to the rotating sink.
//!
//! Producers never block: `send` is a try-enqueue that reports refusal so
//! the receiver can count the drop. A dedicated drain task serializes each
//! entry as one JSON line and hands it to the sink. Closing drops the
//! sender side, which lets the drain finish every queued entry before the
//! task exits; a graceful close loses nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::LogEntry;

/// Downstream destination for serialized log lines.
///
/// Implementations take `&self`; the Rotator carries its own lock.
pub trait LogSink: Send + Sync + 'static {
    fn write_line(&self, line: &[u8]) -> std::io::Result<()>;
}

/// Per-line callback used to feed the rotation index accumulator.
pub type LineTracker = Box<dyn Fn(DateTime<Utc>, &BTreeMap<String, String>) + Send + Sync>;

/// Async single-consumer writer over a bounded queue.
pub struct Writer {
    tx: Mutex<Option<mpsc::Sender<LogEntry>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
    lines_written: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
    write_errors: Arc<AtomicU64>,
}

impl Writer {
    /// Spawn the drain task over a queue of `capacity` entries.
    pub fn new(capacity: usize, sink: Arc<dyn LogSink>, tracker: Option<LineTracker>) -> Self {
        let (tx, mut rx) = mpsc::channel::<LogEntry>(capacity);
        let lines_written = Arc::new(AtomicU64::new(0));
        let bytes_written = Arc::new(AtomicU64::new(0));
        let write_errors = Arc::new(AtomicU64::new(0));

        let lines = lines_written.clone();
        let bytes = bytes_written.clone();
        let errors = write_errors.clone();
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let mut line = match serde_json::to_vec(&entry) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize log entry");
                        errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                line.push(b'\n');
                match sink.write_line(&line) {
                    Ok(()) => {
                        lines.fetch_add(1, Ordering::Relaxed);
                        let n = line.len() as u64;
                        bytes.fetch_add(n, Ordering::Relaxed);
                        metrics::counter!("logtap_bytes_written_total").increment(n);
                        if let Some(tracker) = &tracker {
                            tracker(entry.ts, &entry.labels);
                        }
                    }
                    Err(e) => {
                        // The hot path converts errors into counters; the
                        // rotator retries on the next write.
                        tracing::warn!(error = %e, "Sink write failed");
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            capacity,
            lines_written,
            bytes_written,
            write_errors,
        }
    }

    /// Non-blocking enqueue. `false` means the queue was full (or the
    /// writer is closed) and the entry was not delivered.
    pub fn send(&self, entry: LogEntry) -> bool {
        let Ok(guard) = self.tx.lock() else {
            return false;
        };
        match guard.as_ref() {
            Some(tx) => tx.try_send(entry).is_ok(),
            None => false,
        }
    }

    /// Whether the queue has room for at least one more entry.
    pub fn healthy(&self) -> bool {
        self.tx
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|tx| tx.capacity() > 0))
            .unwrap_or(false)
    }

    /// Current queue depth.
    pub fn queue_len(&self) -> usize {
        self.tx
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|tx| self.capacity - tx.capacity()))
            .unwrap_or(self.capacity)
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the drain to finish every remaining
    /// entry. Idempotent; later `send` calls return `false`.
    pub async fn close(&self) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        drop(tx);
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Writer drain task aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MemSink {
        lines: StdMutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl MemSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                lines: StdMutex::new(Vec::new()),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                lines: StdMutex::new(Vec::new()),
                delay: Some(delay),
            })
        }

        fn collected(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
    }

    impl LogSink for MemSink {
        fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.lines
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(line).trim_end().to_string());
            Ok(())
        }
    }

    fn entry(msg: &str) -> LogEntry {
        LogEntry::new(Utc::now(), BTreeMap::new(), msg.to_string())
    }

    #[tokio::test]
    async fn test_send_then_close_delivers_everything() {
        let sink = MemSink::new();
        let writer = Writer::new(64, sink.clone(), None);
        for i in 0..10 {
            assert!(writer.send(entry(&format!("m{i}"))));
        }
        writer.close().await;

        let lines = sink.collected();
        assert_eq!(lines.len(), 10);
        assert!(lines[0].contains("m0"));
        assert_eq!(writer.lines_written(), 10);
        assert!(writer.bytes_written() > 0);
    }

    #[tokio::test]
    async fn test_full_queue_refuses() {
        let sink = MemSink::slow(Duration::from_millis(50));
        let writer = Writer::new(1, sink.clone(), None);

        let mut accepted = 0;
        let mut refused = 0;
        for i in 0..50 {
            if writer.send(entry(&format!("m{i}"))) {
                accepted += 1;
            } else {
                refused += 1;
            }
        }
        assert!(refused > 0, "expected at least one refusal");
        writer.close().await;
        // Everything accepted was written exactly once.
        assert_eq!(sink.collected().len(), accepted);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_sends() {
        let sink = MemSink::new();
        let writer = Writer::new(4, sink.clone(), None);
        assert!(writer.send(entry("a")));
        writer.close().await;
        writer.close().await;
        assert!(!writer.send(entry("b")));
        assert_eq!(sink.collected().len(), 1);
    }

    #[tokio::test]
    async fn test_tracker_sees_each_line() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let sink = MemSink::new();
        let writer = Writer::new(
            8,
            sink,
            Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        for _ in 0..5 {
            assert!(writer.send(entry("x")));
        }
        writer.close().await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_healthy_tracks_capacity() {
        let sink = MemSink::slow(Duration::from_millis(100));
        let writer = Writer::new(1, sink, None);
        assert!(writer.healthy());
        writer.send(entry("a"));
        writer.send(entry("b"));
        // Either the first entry is in flight and the queue holds the
        // second, or both are queued; with capacity 1 the queue is full.
        assert!(!writer.healthy() || writer.queue_len() == 0);
        writer.close().await;
    }
}
