//! Workload discovery: by kind+name, label selector, or tap state.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::api::{Api, ListParams};
use kube::Client;

use crate::workload::{Workload, WorkloadError, WorkloadKind};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: WorkloadKind,
        name: String,
        namespace: String,
    },
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// Read-side access to the three workload kinds.
#[derive(Clone)]
pub struct Discovery {
    client: Client,
}

impl Discovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetch one workload by kind and name.
    pub async fn find(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
    ) -> Result<Workload, DiscoveryError> {
        let not_found = |e: kube::Error| match &e {
            kube::Error::Api(response) if response.code == 404 => DiscoveryError::NotFound {
                kind,
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            _ => DiscoveryError::Api(e),
        };
        match kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let object = api.get(name).await.map_err(not_found)?;
                Ok(Workload::from_deployment(object)?)
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                let object = api.get(name).await.map_err(not_found)?;
                Ok(Workload::from_stateful_set(object)?)
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                let object = api.get(name).await.map_err(not_found)?;
                Ok(Workload::from_daemon_set(object)?)
            }
        }
    }

    /// Workloads of every kind matching a label selector.
    pub async fn list_by_selector(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Workload>, DiscoveryError> {
        let params = ListParams::default().labels(selector);
        self.list_all(namespace, &params).await
    }

    /// Workloads whose pod template carries a non-empty `tapped`
    /// annotation. Annotations are not selectable server-side, so this
    /// lists everything and filters locally.
    pub async fn list_tapped(&self, namespace: &str) -> Result<Vec<Workload>, DiscoveryError> {
        let params = ListParams::default();
        let mut workloads = self.list_all(namespace, &params).await?;
        workloads.retain(Workload::is_tapped);
        Ok(workloads)
    }

    async fn list_all(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> Result<Vec<Workload>, DiscoveryError> {
        let mut out = Vec::new();

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        for object in deployments.list(params).await? {
            match Workload::from_deployment(object) {
                Ok(workload) => out.push(workload),
                Err(e) => tracing::debug!(error = %e, "Skipping malformed Deployment"),
            }
        }

        let stateful_sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        for object in stateful_sets.list(params).await? {
            match Workload::from_stateful_set(object) {
                Ok(workload) => out.push(workload),
                Err(e) => tracing::debug!(error = %e, "Skipping malformed StatefulSet"),
            }
        }

        let daemon_sets: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        for object in daemon_sets.list(params).await? {
            match Workload::from_daemon_set(object) {
                Ok(workload) => out.push(workload),
                Err(e) => tracing::debug!(error = %e, "Skipping malformed DaemonSet"),
            }
        }

        Ok(out)
    }
}
