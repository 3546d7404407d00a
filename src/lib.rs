//! On-demand log tapping for Kubernetes workloads.
//!
//! LogTap attaches short-lived forwarder sidecars to selected workloads
//! (Deployments, StatefulSets, DaemonSets) and runs a receiver that redacts,
//! buffers, rotates, compresses, indexes, and archives the streamed logs.
//!
//! ## Architecture
//!
//! Two coupled subsystems:
//!
//! 1. **Workload mutation** (`discovery`, `patch`, `sidecar`, `manager`,
//!    `advisor`, `rbac`, `orphan` modules) - Session-scoped injection and
//!    removal of forwarder sidecars, with multi-session composition,
//!    pre-flight resource checks, and orphan reconciliation.
//!
//! 2. **Capture pipeline** (`receiver`, `writer`, `rotator`, `redact`,
//!    `ring`, `stats`, `alert`, `webhook`, `archive`, `audit`, `tailer`
//!    modules) - A non-blocking HTTP ingest server draining into a
//!    size/disk-capped rotating writer with compression and a crash-safe
//!    index.
//!
//! ## Usage
//!
//! Run the receiver and tap a workload:
//!
//! ```bash
//! logtap serve --dir ./capture --listen 0.0.0.0:3100
//! logtap tap deployment/api-gw -n default --target recv:3100
//! ```

pub mod advisor;
pub mod alert;
pub mod archive;
pub mod audit;
pub mod config;
pub mod discovery;
pub mod entry;
pub mod index;
pub mod manager;
pub mod orphan;
pub mod patch;
pub mod rbac;
pub mod receiver;
pub mod redact;
pub mod ring;
pub mod rotator;
pub mod session;
pub mod sidecar;
pub mod stats;
pub mod tailer;
pub mod telemetry;
pub mod webhook;
pub mod workload;
pub mod writer;

pub use entry::LogEntry;
pub use session::{add_session, new_session_id, parse_sessions, remove_session};
pub use workload::{Workload, WorkloadKind};
