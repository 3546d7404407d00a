//! HTTP ingest server: accepts Loki-style and raw NDJSON pushes, fans
//! accepted entries out to the redactor, live ring, writer, stats, and
//! audit log.
//!
//! The hot path never blocks on the writer: a full queue is a counted
//! drop, not a stalled sender. Readiness reflects queue capacity so load
//! balancers can shed traffic during backpressure.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;

use crate::alert::{self, AlertEngine};
use crate::audit::{AuditEvent, AuditLogger};
use crate::config::ReceiverConfig;
use crate::entry::LogEntry;
use crate::index::{CaptureMetadata, RedactionMetadata};
use crate::redact::Redactor;
use crate::ring::LogRing;
use crate::rotator::{Rotator, RotatorConfig};
use crate::stats::Stats;
use crate::telemetry;
use crate::webhook::{WebhookDispatcher, WebhookEvent, WebhookStats};
use crate::writer::Writer;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// HTTP API version reported by `/api/version`.
const API_VERSION: u32 = 1;

/// Shared handler state.
pub struct AppState {
    pub writer: Arc<Writer>,
    pub rotator: Arc<Rotator>,
    pub ring: Arc<LogRing>,
    pub stats: Arc<Stats>,
    pub redactor: Option<Arc<Redactor>>,
    pub audit: Option<Arc<AuditLogger>>,
    pub prometheus: Option<PrometheusHandle>,
}

/// Build the ingest router over `state`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/loki/api/v1/push", post(loki_push))
        .route("/logtap/raw", post(raw_push))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/version", get(version))
        .route("/metrics", get(metrics_text))
        // One past the cap so an exactly-at-cap body still reaches the
        // handler and anything larger maps to our own 400.
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES + 1))
        .with_state(state)
}

// --- Payload shapes ---

#[derive(Debug, Deserialize)]
struct LokiPush {
    streams: Vec<LokiStream>,
}

#[derive(Debug, Deserialize)]
struct LokiStream {
    #[serde(default)]
    stream: BTreeMap<String, String>,
    /// `[nanoTimestampString, message]` pairs.
    #[serde(default)]
    values: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    ts: Option<DateTime<Utc>>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    msg: String,
}

// --- Handlers ---

async fn loki_push(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let started = Instant::now();
    let _conn = ConnGuard::new(state.stats.clone());
    let body = match read_body(body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let push: LokiPush = match serde_json::from_slice(&body) {
        Ok(push) => push,
        Err(_) => return bad_request("invalid JSON"),
    };

    // Validate the whole payload before accepting anything: a 400 must
    // not leave a partial push in the pipeline.
    let mut entries = Vec::new();
    for stream in push.streams {
        for (ts, msg) in stream.values {
            let Ok(nanos) = ts.parse::<i64>() else {
                return bad_request("invalid timestamp");
            };
            entries.push(LogEntry::new(
                DateTime::from_timestamp_nanos(nanos),
                stream.stream.clone(),
                msg,
            ));
        }
    }

    let lines = entries.len() as u64;
    for entry in entries {
        accept_entry(&state, entry);
    }

    finish_push(&state, connect, lines, body.len(), started);
    StatusCode::NO_CONTENT.into_response()
}

async fn raw_push(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let started = Instant::now();
    let _conn = ConnGuard::new(state.stats.clone());
    let body = match read_body(body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let mut entries = Vec::new();
    for line in body.split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record: RawRecord = match serde_json::from_slice(line) {
            Ok(record) => record,
            Err(_) => return bad_request("invalid JSON"),
        };
        let ts = match record.ts {
            Some(ts) if ts.timestamp() != 0 => ts,
            _ => Utc::now(),
        };
        entries.push(LogEntry::new(ts, record.labels, record.msg));
    }

    let lines = entries.len() as u64;
    for entry in entries {
        accept_entry(&state, entry);
    }

    finish_push(&state, connect, lines, body.len(), started);
    StatusCode::NO_CONTENT.into_response()
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    if state.writer.healthy() {
        Json(json!({"status": "ok"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reason": "writer backpressure"})),
        )
            .into_response()
    }
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION"), "api": API_VERSION}))
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    let body = state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

// --- Hot path ---

/// Redact, buffer, and enqueue one entry, converting refusal into drop
/// accounting rather than backpressure on the sender.
fn accept_entry(state: &AppState, mut entry: LogEntry) {
    if let Some(redactor) = &state.redactor {
        entry.msg = redactor.redact(&entry.msg);
    }
    state.ring.push(entry.clone());
    if state.writer.send(entry.clone()) {
        state.stats.record_entry(&entry.labels);
        counter!("logtap_logs_received_total").increment(1);
    } else {
        state.stats.record_dropped();
        counter!("logtap_logs_dropped_total").increment(1);
        counter!("logtap_backpressure_events_total").increment(1);
    }
}

fn finish_push(
    state: &AppState,
    connect: Option<ConnectInfo<SocketAddr>>,
    lines: u64,
    bytes: usize,
    started: Instant,
) {
    let elapsed = started.elapsed();
    histogram!("logtap_push_duration_seconds").record(elapsed.as_secs_f64());
    if let Some(audit) = &state.audit {
        let remote_ip = connect.map(|ConnectInfo(addr)| addr.ip().to_string());
        audit.log(&AuditEvent::push(
            remote_ip,
            lines,
            bytes as u64,
            elapsed.as_millis() as u64,
        ));
    }
}

fn read_body(body: Result<Bytes, BytesRejection>) -> Result<Bytes, Response> {
    let body = body.map_err(|_| bad_request("request body too large"))?;
    if body.len() > MAX_BODY_BYTES {
        return Err(bad_request("request body too large"));
    }
    Ok(body)
}

fn bad_request(reason: &str) -> Response {
    (StatusCode::BAD_REQUEST, reason.to_string()).into_response()
}

/// Tracks the active-connection gauge for the duration of a request.
struct ConnGuard {
    stats: Arc<Stats>,
}

impl ConnGuard {
    fn new(stats: Arc<Stats>) -> Self {
        stats.conn_opened();
        gauge!("logtap_active_connections").increment(1.0);
        Self { stats }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.stats.conn_closed();
        gauge!("logtap_active_connections").decrement(1.0);
    }
}

// --- Server assembly ---

/// Run the full receiver pipeline until SIGINT/SIGTERM, then drain and
/// finalize the capture.
pub async fn run_server(cfg: ReceiverConfig) -> anyhow::Result<()> {
    use anyhow::Context;

    fs::create_dir_all(&cfg.dir).context("Failed to create capture directory")?;
    let started = Utc::now();

    let prometheus = match telemetry::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder unavailable; /metrics will be empty");
            None
        }
    };

    let redactor = if cfg.redact {
        let mut redactor = Redactor::new(&cfg.redact_patterns)?.with_callback(Box::new(|name| {
            counter!("logtap_redactions_total", "pattern" => name.to_string()).increment(1);
        }));
        if let Some(path) = &cfg.custom_pattern_file {
            redactor
                .load_custom_patterns(path)
                .context("Failed to load custom redaction patterns")?;
        }
        Some(Arc::new(redactor))
    } else {
        None
    };

    let mut metadata = CaptureMetadata::new(started);
    metadata.redaction = Some(RedactionMetadata {
        enabled: redactor.is_some(),
        patterns: redactor
            .as_ref()
            .map(|r| r.pattern_names())
            .unwrap_or_default(),
    });
    metadata
        .save(&cfg.dir)
        .context("Failed to write capture metadata")?;

    let dispatcher = Arc::new(WebhookDispatcher::new(
        cfg.webhook_urls.clone(),
        cfg.webhook_events.clone(),
        &cfg.webhook_auth,
    )?);

    let dir_display = cfg.dir.display().to_string();
    let warn_dispatcher = dispatcher.clone();
    let warn_dir = dir_display.clone();
    let rotator = Arc::new(
        Rotator::new(RotatorConfig {
            dir: cfg.dir.clone(),
            max_file: cfg.max_file,
            max_disk: cfg.max_disk,
            compress: cfg.compress,
        })
        .context("Failed to open capture directory")?
        .with_rotate_hook(Box::new(|reason| {
            counter!("logtap_rotation_total", "reason" => reason.to_string()).increment(1);
        }))
        .with_error_hook(Box::new(|e| {
            tracing::error!(error = %e, "Capture write error");
            counter!("logtap_rotation_errors_total").increment(1);
        }))
        .with_disk_warning_hook(Box::new(move |usage, cap| {
            tracing::warn!(usage, cap, "Capture directory nearing disk cap");
            warn_dispatcher.fire(
                &WebhookEvent::named("disk_warning")
                    .with_dir(warn_dir.clone())
                    .with_detail(format!("capture directory at {usage} of {cap} bytes")),
            );
        })),
    );

    let tracked = rotator.clone();
    let writer = Arc::new(Writer::new(
        cfg.queue,
        rotator.clone(),
        Some(Box::new(move |ts, labels| tracked.track_line(ts, labels))),
    ));

    let audit = if cfg.audit {
        Some(Arc::new(
            AuditLogger::open(&cfg.dir).context("Failed to open audit log")?,
        ))
    } else {
        None
    };

    let state = Arc::new(AppState {
        writer: writer.clone(),
        rotator: rotator.clone(),
        ring: Arc::new(LogRing::new(cfg.ring_capacity)),
        stats: Arc::new(Stats::new()),
        redactor,
        audit: audit.clone(),
        prometheus,
    });

    if let Some(audit) = &audit {
        audit.log(&AuditEvent::named("server_started"));
    }
    dispatcher.fire(&WebhookEvent::named("capture_started").with_dir(dir_display.clone()));

    // Shutdown plumbing: first signal wins.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    // Observation tick: update gauges and evaluate alert rules.
    let rules = match &cfg.alert_rules_file {
        Some(path) => alert::load_rules(path).context("Failed to load alert rules")?,
        None => Vec::new(),
    };
    let mut engine = AlertEngine::new(rules);
    let tick_state = state.clone();
    let tick_dispatcher = dispatcher.clone();
    let mut tick_shutdown = shutdown_rx.clone();
    let tick_interval = Duration::from_secs(cfg.alert_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snap = tick_state.stats.snapshot(
                        tick_state.rotator.disk_usage(),
                        tick_state.rotator.disk_cap(),
                        tick_state.writer.bytes_written(),
                    );
                    gauge!("logtap_disk_usage_bytes").set(snap.disk_usage as f64);
                    gauge!("logtap_writer_queue_length").set(tick_state.writer.queue_len() as f64);
                    for event in engine.evaluate(&snap) {
                        tick_dispatcher.fire(&event);
                    }
                }
                _ = tick_shutdown.changed() => break,
            }
        }
    });

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen))?;
    tracing::info!(listen = %cfg.listen, dir = %dir_display, "Receiver listening");

    let mut serve_shutdown = shutdown_rx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = serve_shutdown.changed().await;
    })
    .await
    .context("Ingest server failed")?;

    // Drain the queue, close the capture, finalize metadata.
    writer.close().await;
    if let Err(e) = rotator.close() {
        tracing::error!(error = %e, "Failed to close capture cleanly");
    }

    metadata.stopped = Some(Utc::now());
    metadata.total_lines = writer.lines_written();
    metadata.total_bytes = writer.bytes_written();
    metadata.labels_seen = state.stats.labels_seen();
    if let Err(e) = metadata.save(&cfg.dir) {
        tracing::error!(error = %e, "Failed to finalize capture metadata");
    }

    if let Some(audit) = &audit {
        audit.log(&AuditEvent::named("server_stopped"));
    }
    dispatcher.fire(
        &WebhookEvent::named("capture_stopped")
            .with_dir(dir_display)
            .with_stats(WebhookStats {
                lines_written: writer.lines_written(),
                bytes_written: writer.bytes_written(),
                disk_usage: rotator.disk_usage(),
                disk_cap: rotator.disk_cap(),
            }),
    );

    tracing::info!(
        lines = writer.lines_written(),
        bytes = writer.bytes_written(),
        "Capture complete"
    );
    Ok(())
}
