//! Orphan detection: sidecars whose receivers are gone, stale annotation
//! ledgers, and abandoned receiver pods.

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;

use crate::discovery::{Discovery, DiscoveryError};
use crate::manager::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::workload::WorkloadKind;

/// Label naming receiver pods, paired with the managed-by label.
pub const RECEIVER_NAME_LABEL: &str = "app.kubernetes.io/name";
pub const RECEIVER_NAME_VALUE: &str = "logtap-receiver";

/// Probe deciding whether a receiver target (`host:port`) is reachable.
pub type ReachabilityProbe = dyn Fn(&str) -> bool + Send + Sync;

/// A workload still carrying forwarder sidecars.
#[derive(Debug, Clone)]
pub struct OrphanedSidecar {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
    pub sessions: Vec<String>,
    pub target: String,
    /// Whether the annotated receiver answered the caller's probe; false
    /// when no probe was supplied.
    pub target_reachable: bool,
}

/// A workload annotated as tapped whose sidecars are already gone.
#[derive(Debug, Clone)]
pub struct StaleAnnotation {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
    pub sessions: Vec<String>,
}

/// A receiver pod left behind after its sessions ended.
#[derive(Debug, Clone)]
pub struct OrphanedReceiver {
    pub pod: String,
    pub namespace: String,
    pub age_seconds: i64,
}

/// Everything one reconciliation pass found.
#[derive(Debug, Default)]
pub struct OrphanScan {
    pub sidecars: Vec<OrphanedSidecar>,
    pub stale: Vec<StaleAnnotation>,
    pub receivers: Vec<OrphanedReceiver>,
}

impl OrphanScan {
    pub fn is_empty(&self) -> bool {
        self.sidecars.is_empty() && self.stale.is_empty() && self.receivers.is_empty()
    }
}

/// Scans a namespace for LogTap leftovers.
#[derive(Clone)]
pub struct OrphanReconciler {
    client: Client,
    discovery: Discovery,
}

impl OrphanReconciler {
    pub fn new(client: Client) -> Self {
        Self {
            discovery: Discovery::new(client.clone()),
            client,
        }
    }

    /// Classify every tapped workload and list abandoned receiver pods.
    pub async fn scan(
        &self,
        namespace: &str,
        probe: Option<&ReachabilityProbe>,
    ) -> Result<OrphanScan, DiscoveryError> {
        let mut scan = OrphanScan::default();

        for workload in self.discovery.list_tapped(namespace).await? {
            let sessions = workload.tapped_sessions();
            if workload.forwarder_containers().is_empty() {
                scan.stale.push(StaleAnnotation {
                    kind: workload.kind,
                    name: workload.name,
                    namespace: workload.namespace,
                    sessions,
                });
            } else {
                let target = workload.target().unwrap_or_default().to_string();
                let target_reachable = match probe {
                    Some(probe) if !target.is_empty() => probe(&target),
                    _ => false,
                };
                scan.sidecars.push(OrphanedSidecar {
                    kind: workload.kind,
                    name: workload.name,
                    namespace: workload.namespace,
                    sessions,
                    target,
                    target_reachable,
                });
            }
        }

        scan.receivers = self.list_receiver_pods(namespace).await?;

        tracing::info!(
            namespace = %namespace,
            sidecars = scan.sidecars.len(),
            stale = scan.stale.len(),
            receivers = scan.receivers.len(),
            "Orphan scan complete"
        );
        Ok(scan)
    }

    /// Receiver pods in the namespace, by the managed-by + name labels.
    /// Listing failures are swallowed; receiver discovery is best-effort.
    async fn list_receiver_pods(
        &self,
        namespace: &str,
    ) -> Result<Vec<OrphanedReceiver>, DiscoveryError> {
        let selector = format!(
            "{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{RECEIVER_NAME_LABEL}={RECEIVER_NAME_VALUE}"
        );
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = match api.list(&ListParams::default().labels(&selector)).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "Receiver pod listing failed");
                return Ok(Vec::new());
            }
        };

        let now = Utc::now();
        let mut receivers = Vec::new();
        for pod in pods {
            let Some(name) = pod.metadata.name else {
                continue;
            };
            let age_seconds = pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|ts| (now - ts.0).num_seconds().max(0))
                .unwrap_or(0);
            receivers.push(OrphanedReceiver {
                pod: name,
                namespace: namespace.to_string(),
                age_seconds,
            });
        }
        Ok(receivers)
    }
}
