//! Prometheus recorder installation and metric registration.
//!
//! Everything in the pipeline emits through the `metrics` facade macros;
//! this module installs the exporter once and describes the stable metric
//! names served at `/metrics`.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return the render handle.
///
/// Call once per process; a second call fails because the recorder slot
/// is already taken.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!(
        "logtap_logs_received_total",
        Unit::Count,
        "Entries accepted by the receiver"
    );
    describe_counter!(
        "logtap_logs_dropped_total",
        Unit::Count,
        "Entries refused because the writer queue was full"
    );
    describe_counter!(
        "logtap_bytes_written_total",
        Unit::Bytes,
        "Bytes written to the capture directory"
    );
    describe_gauge!(
        "logtap_disk_usage_bytes",
        Unit::Bytes,
        "Current capture directory size"
    );
    describe_gauge!(
        "logtap_active_connections",
        Unit::Count,
        "In-flight ingest requests"
    );
    describe_counter!(
        "logtap_backpressure_events_total",
        Unit::Count,
        "Deliveries rejected by a full writer queue"
    );
    describe_counter!(
        "logtap_redactions_total",
        Unit::Count,
        "Messages with at least one substitution, by pattern"
    );
    describe_histogram!(
        "logtap_push_duration_seconds",
        Unit::Seconds,
        "Wall time spent handling one push request"
    );
    describe_gauge!(
        "logtap_writer_queue_length",
        Unit::Count,
        "Entries waiting in the writer queue"
    );
    describe_counter!(
        "logtap_rotation_total",
        Unit::Count,
        "Completed rotations, by reason"
    );
    describe_counter!(
        "logtap_rotation_errors_total",
        Unit::Count,
        "Failed writes or rotations"
    );
}
