//! Normalized view over the three supported workload kinds.
//!
//! Deployments, StatefulSets, and DaemonSets share one record carrying
//! the fields LogTap cares about plus the typed object as a kind-tagged
//! payload. Operations dispatch on the kind and reach into the payload at
//! the edge; everything else treats the record as the contract.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;

use crate::session::{parse_sessions, FORWARDER_PREFIX};

/// Annotation listing the active session IDs on a pod template.
pub const TAPPED_ANNOTATION: &str = "logtap.dev/tapped";

/// Annotation carrying the receiver `host:port`.
pub const TARGET_ANNOTATION: &str = "logtap.dev/target";

/// Annotation selecting the forwarder flavor (`logtap` or `fluent-bit`).
pub const FORWARDER_ANNOTATION: &str = "logtap.dev/forwarder";

/// Supported workload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkloadKind {
    type Err = UnsupportedKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deploy" => Ok(WorkloadKind::Deployment),
            "statefulset" | "sts" => Ok(WorkloadKind::StatefulSet),
            "daemonset" | "ds" => Ok(WorkloadKind::DaemonSet),
            _ => Err(UnsupportedKind(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported workload kind: {0} (want Deployment, StatefulSet, or DaemonSet)")]
pub struct UnsupportedKind(pub String);

/// The typed object behind a normalized workload.
#[derive(Debug, Clone)]
pub enum WorkloadRaw {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("{kind} object has no name/namespace metadata")]
    MissingMetadata { kind: WorkloadKind },
    #[error("{kind} {name} has no pod template spec")]
    MissingTemplate { kind: WorkloadKind, name: String },
}

/// Normalized workload record. `name + namespace + kind` identifies a
/// workload within a cluster.
#[derive(Debug, Clone)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
    /// Desired pod count: `spec.replicas` (default 1) for Deployments and
    /// StatefulSets, `status.desiredNumberScheduled` for DaemonSets.
    pub replicas: i32,
    pub template_annotations: BTreeMap<String, String>,
    pub raw: WorkloadRaw,
}

impl Workload {
    pub fn from_deployment(d: Deployment) -> Result<Self, WorkloadError> {
        let kind = WorkloadKind::Deployment;
        let (name, namespace) = name_and_namespace(&d.metadata, kind)?;
        let spec = d.spec.as_ref();
        let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);
        let template_annotations = spec
            .map(|s| annotations_of(&s.template))
            .unwrap_or_default();
        Ok(Self {
            kind,
            name,
            namespace,
            replicas,
            template_annotations,
            raw: WorkloadRaw::Deployment(d),
        })
    }

    pub fn from_stateful_set(s: StatefulSet) -> Result<Self, WorkloadError> {
        let kind = WorkloadKind::StatefulSet;
        let (name, namespace) = name_and_namespace(&s.metadata, kind)?;
        let spec = s.spec.as_ref();
        let replicas = spec.and_then(|sp| sp.replicas).unwrap_or(1);
        let template_annotations = spec
            .map(|sp| annotations_of(&sp.template))
            .unwrap_or_default();
        Ok(Self {
            kind,
            name,
            namespace,
            replicas,
            template_annotations,
            raw: WorkloadRaw::StatefulSet(s),
        })
    }

    pub fn from_daemon_set(d: DaemonSet) -> Result<Self, WorkloadError> {
        let kind = WorkloadKind::DaemonSet;
        let (name, namespace) = name_and_namespace(&d.metadata, kind)?;
        let replicas = d
            .status
            .as_ref()
            .map(|s| s.desired_number_scheduled)
            .unwrap_or(0);
        let template_annotations = d
            .spec
            .as_ref()
            .map(|s| annotations_of(&s.template))
            .unwrap_or_default();
        Ok(Self {
            kind,
            name,
            namespace,
            replicas,
            template_annotations,
            raw: WorkloadRaw::DaemonSet(d),
        })
    }

    /// The pod template of the underlying object, when it has one.
    pub fn template(&self) -> Option<&PodTemplateSpec> {
        match &self.raw {
            WorkloadRaw::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            WorkloadRaw::StatefulSet(s) => s.spec.as_ref().map(|sp| &sp.template),
            WorkloadRaw::DaemonSet(d) => d.spec.as_ref().map(|s| &s.template),
        }
    }

    /// Names of the containers in the pod template.
    pub fn container_names(&self) -> Vec<String> {
        self.template()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Names of the injected forwarder containers.
    pub fn forwarder_containers(&self) -> Vec<String> {
        self.container_names()
            .into_iter()
            .filter(|name| name.starts_with(FORWARDER_PREFIX))
            .collect()
    }

    /// Sessions listed in the `tapped` annotation, in order.
    pub fn tapped_sessions(&self) -> Vec<String> {
        self.template_annotations
            .get(TAPPED_ANNOTATION)
            .map(|v| parse_sessions(v))
            .unwrap_or_default()
    }

    pub fn is_tapped(&self) -> bool {
        !self.tapped_sessions().is_empty()
    }

    pub fn target(&self) -> Option<&str> {
        self.template_annotations
            .get(TARGET_ANNOTATION)
            .map(String::as_str)
    }

    pub fn forwarder_annotation(&self) -> Option<&str> {
        self.template_annotations
            .get(FORWARDER_ANNOTATION)
            .map(String::as_str)
    }
}

fn name_and_namespace(
    metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    kind: WorkloadKind,
) -> Result<(String, String), WorkloadError> {
    let name = metadata
        .name
        .clone()
        .ok_or(WorkloadError::MissingMetadata { kind })?;
    let namespace = metadata.namespace.clone().unwrap_or_default();
    Ok((name, namespace))
}

fn annotations_of(template: &PodTemplateSpec) -> BTreeMap<String, String> {
    template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

    /// A Deployment with one `app` container and the given template
    /// annotations.
    pub fn deployment(
        name: &str,
        namespace: &str,
        replicas: i32,
        annotations: &[(&str, &str)],
    ) -> Deployment {
        let annotations: BTreeMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector::default(),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        annotations: (!annotations.is_empty()).then_some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            image: Some("registry.local/app:1".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}
