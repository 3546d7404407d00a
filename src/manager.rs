//! Session orchestration: inject, remove, and remove-all.
//!
//! The manager owns the retry budget for optimistic-concurrency
//! conflicts because only it can re-derive the mutation from a freshly
//! read workload. Every attempt re-reads the live object, re-checks the
//! preconditions, and rebuilds the patch from the current annotation
//! ledger.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;

use crate::config::{ForwarderFlavor, TapConfig};
use crate::discovery::{Discovery, DiscoveryError};
use crate::patch::{best_effort_delete, PatchEngine, PatchError, PatchSpec, RemovePatchSpec};
use crate::session::{add_session, forwarder_container_name, remove_session};
use crate::sidecar::{self, SidecarError};
use crate::workload::{
    Workload, WorkloadKind, FORWARDER_ANNOTATION, TAPPED_ANNOTATION, TARGET_ANNOTATION,
};

/// Label marking every object LogTap manages.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "logtap";

/// Label tying a managed object to its session.
pub const SESSION_LABEL: &str = "logtap.dev/session";

/// Conflict retry budget.
const MAX_PATCH_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("session {session} is already tapped on {kind} {namespace}/{name}")]
    SessionAlreadyPresent {
        session: String,
        kind: WorkloadKind,
        name: String,
        namespace: String,
    },
    #[error("session {session} is not tapped on {kind} {namespace}/{name}")]
    SessionNotFound {
        session: String,
        kind: WorkloadKind,
        name: String,
        namespace: String,
    },
    #[error(transparent)]
    Sidecar(#[from] SidecarError),
    #[error("{kind} {namespace}/{name}: {source}")]
    Patch {
        kind: WorkloadKind,
        name: String,
        namespace: String,
        #[source]
        source: PatchError,
    },
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("failed to create ConfigMap {name}: {source}")]
    ConfigMap {
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Orchestrates session-scoped sidecar injection and removal.
#[derive(Clone)]
pub struct SessionManager {
    client: Client,
    discovery: Discovery,
    patch: PatchEngine,
}

impl SessionManager {
    pub fn new(client: Client) -> Self {
        Self {
            discovery: Discovery::new(client.clone()),
            patch: PatchEngine::new(client.clone()),
            client,
        }
    }

    /// Attach a forwarder sidecar for `cfg.session` to `workload`.
    /// Returns the template diff; dry-run skips every write.
    pub async fn inject(
        &self,
        workload: &Workload,
        cfg: &TapConfig,
        dry_run: bool,
    ) -> Result<String, ManagerError> {
        let mut configmap_created = false;
        let mut fresh = workload.clone();
        for attempt in 0..MAX_PATCH_ATTEMPTS {
            if attempt > 0 {
                fresh = self
                    .discovery
                    .find(workload.kind, &workload.name, &workload.namespace)
                    .await?;
            }

            let sessions = fresh.tapped_sessions();
            let container_name = forwarder_container_name(&cfg.session);
            if sessions.iter().any(|s| s == &cfg.session)
                || fresh.container_names().contains(&container_name)
            {
                return Err(ManagerError::SessionAlreadyPresent {
                    session: cfg.session.clone(),
                    kind: fresh.kind,
                    name: fresh.name.clone(),
                    namespace: fresh.namespace.clone(),
                });
            }

            let spec = build_inject_spec(&fresh.template_annotations, cfg)?;

            // The ConfigMap must exist before the pods roll; a failure
            // after this point leaves it behind for the reconciler.
            if cfg.flavor == ForwarderFlavor::FluentBit && !dry_run && !configmap_created {
                self.create_fluent_bit_configmap(&fresh.namespace, cfg)
                    .await?;
                configmap_created = true;
            }

            match self
                .patch
                .apply(fresh.kind, &fresh.name, &fresh.namespace, &spec, dry_run)
                .await
            {
                Ok(diff) => {
                    tracing::info!(
                        kind = %fresh.kind,
                        workload = %fresh.name,
                        namespace = %fresh.namespace,
                        session = %cfg.session,
                        dry_run,
                        "Forwarder injected"
                    );
                    return Ok(diff);
                }
                Err(e) if e.is_conflict() && attempt + 1 < MAX_PATCH_ATTEMPTS => {
                    tracing::debug!(
                        workload = %fresh.name,
                        attempt = attempt + 1,
                        "Patch conflict, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(source) => {
                    return Err(ManagerError::Patch {
                        kind: fresh.kind,
                        name: fresh.name.clone(),
                        namespace: fresh.namespace.clone(),
                        source,
                    })
                }
            }
        }
        Err(ManagerError::Patch {
            kind: fresh.kind,
            name: fresh.name.clone(),
            namespace: fresh.namespace.clone(),
            source: PatchError::Conflict {
                kind: fresh.kind,
                name: fresh.name,
                namespace: fresh.namespace,
            },
        })
    }

    /// Detach one session's forwarder. The last session out also clears
    /// the annotation ledger.
    pub async fn remove(
        &self,
        workload: &Workload,
        session: &str,
        dry_run: bool,
    ) -> Result<String, ManagerError> {
        let mut fresh = workload.clone();
        for attempt in 0..MAX_PATCH_ATTEMPTS {
            if attempt > 0 {
                fresh = self
                    .discovery
                    .find(workload.kind, &workload.name, &workload.namespace)
                    .await?;
            }

            if !fresh.tapped_sessions().iter().any(|s| s == session) {
                return Err(ManagerError::SessionNotFound {
                    session: session.to_string(),
                    kind: fresh.kind,
                    name: fresh.name.clone(),
                    namespace: fresh.namespace.clone(),
                });
            }

            let fluent_bit = fresh.forwarder_annotation() == Some("fluent-bit");
            let spec = build_remove_spec(&fresh.template_annotations, session, fluent_bit);

            match self
                .patch
                .remove(fresh.kind, &fresh.name, &fresh.namespace, &spec, dry_run)
                .await
            {
                Ok(diff) => {
                    if fluent_bit && !dry_run {
                        self.delete_session_configmaps(&fresh.namespace, &[session.to_string()])
                            .await;
                    }
                    tracing::info!(
                        kind = %fresh.kind,
                        workload = %fresh.name,
                        namespace = %fresh.namespace,
                        session = %session,
                        dry_run,
                        "Forwarder removed"
                    );
                    return Ok(diff);
                }
                Err(e) if e.is_conflict() && attempt + 1 < MAX_PATCH_ATTEMPTS => {
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(source) => {
                    return Err(ManagerError::Patch {
                        kind: fresh.kind,
                        name: fresh.name.clone(),
                        namespace: fresh.namespace.clone(),
                        source,
                    })
                }
            }
        }
        Err(ManagerError::Patch {
            kind: fresh.kind,
            name: fresh.name.clone(),
            namespace: fresh.namespace.clone(),
            source: PatchError::Conflict {
                kind: fresh.kind,
                name: fresh.name,
                namespace: fresh.namespace,
            },
        })
    }

    /// Strip every LogTap artifact from the workload in one patch, then
    /// best-effort delete the per-session ConfigMaps.
    pub async fn remove_all(
        &self,
        workload: &Workload,
        dry_run: bool,
    ) -> Result<String, ManagerError> {
        let mut fresh = workload.clone();
        for attempt in 0..MAX_PATCH_ATTEMPTS {
            if attempt > 0 {
                fresh = self
                    .discovery
                    .find(workload.kind, &workload.name, &workload.namespace)
                    .await?;
            }

            let sessions = fresh.tapped_sessions();
            let spec = build_remove_all_spec(&fresh);

            match self
                .patch
                .remove(fresh.kind, &fresh.name, &fresh.namespace, &spec, dry_run)
                .await
            {
                Ok(diff) => {
                    if !dry_run {
                        self.delete_session_configmaps(&fresh.namespace, &sessions)
                            .await;
                    }
                    tracing::info!(
                        kind = %fresh.kind,
                        workload = %fresh.name,
                        namespace = %fresh.namespace,
                        sessions = sessions.len(),
                        dry_run,
                        "All forwarders removed"
                    );
                    return Ok(diff);
                }
                Err(e) if e.is_conflict() && attempt + 1 < MAX_PATCH_ATTEMPTS => {
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(source) => {
                    return Err(ManagerError::Patch {
                        kind: fresh.kind,
                        name: fresh.name.clone(),
                        namespace: fresh.namespace.clone(),
                        source,
                    })
                }
            }
        }
        Err(ManagerError::Patch {
            kind: fresh.kind,
            name: fresh.name.clone(),
            namespace: fresh.namespace.clone(),
            source: PatchError::Conflict {
                kind: fresh.kind,
                name: fresh.name,
                namespace: fresh.namespace,
            },
        })
    }

    async fn create_fluent_bit_configmap(
        &self,
        namespace: &str,
        cfg: &TapConfig,
    ) -> Result<(), ManagerError> {
        let name = sidecar::fluent_bit_configmap_name(&cfg.session);
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    [
                        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                        (SESSION_LABEL.to_string(), cfg.session.clone()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            data: Some(
                [(
                    "fluent-bit.conf".to_string(),
                    sidecar::fluent_bit_config(namespace, &cfg.session, &cfg.target),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), &configmap).await {
            Ok(_) => Ok(()),
            // An orphan from an earlier failed attempt; refresh its data.
            Err(kube::Error::Api(response)) if response.code == 409 => {
                let mut existing =
                    api.get(&name)
                        .await
                        .map_err(|source| ManagerError::ConfigMap {
                            name: name.clone(),
                            source,
                        })?;
                existing.data = configmap.data.clone();
                api.replace(&name, &PostParams::default(), &existing)
                    .await
                    .map_err(|source| ManagerError::ConfigMap {
                        name: name.clone(),
                        source,
                    })?;
                Ok(())
            }
            Err(source) => Err(ManagerError::ConfigMap { name, source }),
        }
    }

    async fn delete_session_configmaps(&self, namespace: &str, sessions: &[String]) {
        if sessions.is_empty() {
            return;
        }
        let names: Vec<String> = sessions
            .iter()
            .map(|s| sidecar::fluent_bit_configmap_name(s))
            .collect();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        if let Err(e) = best_effort_delete(&api, &names).await {
            tracing::warn!(namespace = %namespace, error = %e, "ConfigMap cleanup incomplete");
        }
    }
}

/// The patch one injection applies, derived from the current template
/// annotations.
pub fn build_inject_spec(
    existing_annotations: &BTreeMap<String, String>,
    cfg: &TapConfig,
) -> Result<PatchSpec, SidecarError> {
    let container = sidecar::forwarder_container(cfg)?;

    let old_tapped = existing_annotations
        .get(TAPPED_ANNOTATION)
        .map(String::as_str)
        .unwrap_or("");
    let mut annotations = BTreeMap::new();
    annotations.insert(
        TAPPED_ANNOTATION.to_string(),
        add_session(old_tapped, &cfg.session),
    );
    annotations.insert(TARGET_ANNOTATION.to_string(), cfg.target.clone());
    if cfg.flavor == ForwarderFlavor::FluentBit {
        annotations.insert(FORWARDER_ANNOTATION.to_string(), "fluent-bit".to_string());
    }
    annotations.extend(sidecar::mesh_bypass_annotations(
        existing_annotations,
        &sidecar::port_of(&cfg.target),
    ));

    let volumes = if cfg.flavor == ForwarderFlavor::FluentBit {
        sidecar::fluent_bit_volumes(&cfg.session)
    } else {
        Vec::new()
    };

    Ok(PatchSpec {
        container,
        volumes,
        annotations,
    })
}

/// The patch removing one session, derived from the current annotations.
pub fn build_remove_spec(
    existing_annotations: &BTreeMap<String, String>,
    session: &str,
    fluent_bit: bool,
) -> RemovePatchSpec {
    let old_tapped = existing_annotations
        .get(TAPPED_ANNOTATION)
        .map(String::as_str)
        .unwrap_or("");
    let new_tapped = remove_session(old_tapped, session);

    let mut spec = RemovePatchSpec {
        container_names: vec![forwarder_container_name(session)],
        ..Default::default()
    };
    if fluent_bit {
        spec.volume_names = sidecar::fluent_bit_volume_names();
    }
    if new_tapped.is_empty() {
        spec.delete_annotations = vec![
            TAPPED_ANNOTATION.to_string(),
            TARGET_ANNOTATION.to_string(),
            FORWARDER_ANNOTATION.to_string(),
        ];
    } else {
        spec.set_annotations
            .insert(TAPPED_ANNOTATION.to_string(), new_tapped);
    }
    spec
}

/// The single patch stripping every LogTap artifact from a workload.
pub fn build_remove_all_spec(workload: &Workload) -> RemovePatchSpec {
    let mut delete_annotations = vec![
        TAPPED_ANNOTATION.to_string(),
        TARGET_ANNOTATION.to_string(),
        FORWARDER_ANNOTATION.to_string(),
    ];
    delete_annotations.extend(sidecar::mesh_bypass_keys());

    RemovePatchSpec {
        container_names: workload.forwarder_containers(),
        volume_names: if workload.forwarder_annotation() == Some("fluent-bit") {
            sidecar::fluent_bit_volume_names()
        } else {
            Vec::new()
        },
        set_annotations: BTreeMap::new(),
        delete_annotations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SidecarResources;
    use crate::patch::{apply_to_template, remove_from_template};
    use crate::workload::test_fixtures::deployment;

    fn tap(session: &str, flavor: ForwarderFlavor, image: Option<&str>) -> TapConfig {
        TapConfig {
            session: session.to_string(),
            target: "recv:3100".to_string(),
            flavor,
            image: image.map(String::from),
            resources: SidecarResources::default(),
        }
    }

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_inject_spec_first_session() {
        let spec = build_inject_spec(
            &BTreeMap::new(),
            &tap("lt-0000000000000001", ForwarderFlavor::Logtap, None),
        )
        .unwrap();
        assert_eq!(
            spec.annotations[TAPPED_ANNOTATION],
            "lt-0000000000000001"
        );
        assert_eq!(spec.annotations[TARGET_ANNOTATION], "recv:3100");
        assert!(!spec.annotations.contains_key(FORWARDER_ANNOTATION));
        assert!(spec.volumes.is_empty());
    }

    #[test]
    fn test_inject_spec_composes_sessions() {
        let existing = annotations(&[
            (TAPPED_ANNOTATION, "lt-a"),
            (TARGET_ANNOTATION, "recv:3100"),
        ]);
        let spec =
            build_inject_spec(&existing, &tap("lt-b", ForwarderFlavor::Logtap, None)).unwrap();
        assert_eq!(spec.annotations[TAPPED_ANNOTATION], "lt-a,lt-b");
    }

    #[test]
    fn test_inject_spec_fluent_bit() {
        let spec = build_inject_spec(
            &BTreeMap::new(),
            &tap("lt-b", ForwarderFlavor::FluentBit, Some("fluent/fluent-bit:3.0")),
        )
        .unwrap();
        assert_eq!(spec.annotations[FORWARDER_ANNOTATION], "fluent-bit");
        assert_eq!(spec.volumes.len(), 2);
    }

    #[test]
    fn test_inject_spec_adds_mesh_bypass() {
        let existing = annotations(&[("linkerd.io/inject", "enabled")]);
        let spec =
            build_inject_spec(&existing, &tap("lt-a", ForwarderFlavor::Logtap, None)).unwrap();
        assert_eq!(
            spec.annotations["config.linkerd.io/skip-outbound-ports"],
            "3100"
        );
    }

    #[test]
    fn test_remove_spec_last_session_clears_ledger() {
        let existing = annotations(&[
            (TAPPED_ANNOTATION, "lt-a"),
            (TARGET_ANNOTATION, "recv:3100"),
        ]);
        let spec = build_remove_spec(&existing, "lt-a", false);
        assert_eq!(spec.container_names, vec!["logtap-forwarder-lt-a"]);
        assert!(spec.set_annotations.is_empty());
        assert_eq!(spec.delete_annotations.len(), 3);
        assert!(spec.volume_names.is_empty());
    }

    #[test]
    fn test_remove_spec_keeps_other_sessions() {
        let existing = annotations(&[
            (TAPPED_ANNOTATION, "lt-a,lt-b"),
            (TARGET_ANNOTATION, "recv:3100"),
        ]);
        let spec = build_remove_spec(&existing, "lt-a", false);
        assert_eq!(spec.set_annotations[TAPPED_ANNOTATION], "lt-b");
        assert!(spec.delete_annotations.is_empty());
    }

    #[test]
    fn test_remove_spec_fluent_bit_drops_volumes() {
        let existing = annotations(&[
            (TAPPED_ANNOTATION, "lt-a"),
            (FORWARDER_ANNOTATION, "fluent-bit"),
        ]);
        let spec = build_remove_spec(&existing, "lt-a", true);
        assert_eq!(spec.volume_names.len(), 2);
    }

    #[test]
    fn test_inject_then_remove_roundtrip_on_template() {
        // Scenario: single-session inject then remove restores the
        // original template.
        let d = deployment("api-gw", "default", 1, &[]);
        let original = d.spec.as_ref().unwrap().template.clone();
        let mut template = original.clone();

        let cfg = tap("lt-0000000000000001", ForwarderFlavor::Logtap, None);
        let inject = build_inject_spec(&BTreeMap::new(), &cfg).unwrap();
        apply_to_template(&mut template, &inject);

        let containers: Vec<_> = template
            .spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(containers, vec!["app", "logtap-forwarder-lt-0000000000000001"]);
        let annotations = template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap()
            .clone();
        assert_eq!(annotations[TAPPED_ANNOTATION], "lt-0000000000000001");
        assert_eq!(annotations[TARGET_ANNOTATION], "recv:3100");

        let remove = build_remove_spec(&annotations, "lt-0000000000000001", false);
        remove_from_template(&mut template, &remove);
        assert_eq!(
            crate::patch::template_diff(Some(&original), Some(&template)),
            ""
        );
    }

    #[test]
    fn test_multi_session_composition_on_template() {
        // Scenario: injecting lt-b on a workload already tapped by lt-a
        // keeps both sidecars and the shared target.
        let d = deployment("api-gw", "default", 1, &[]);
        let mut template = d.spec.as_ref().unwrap().template.clone();

        let first = tap("lt-000000000000000a", ForwarderFlavor::Logtap, None);
        apply_to_template(
            &mut template,
            &build_inject_spec(&BTreeMap::new(), &first).unwrap(),
        );
        let annotations_after_first = template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap()
            .clone();

        let second = tap("lt-000000000000000b", ForwarderFlavor::Logtap, None);
        apply_to_template(
            &mut template,
            &build_inject_spec(&annotations_after_first, &second).unwrap(),
        );

        let annotations = template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap();
        assert_eq!(
            annotations[TAPPED_ANNOTATION],
            "lt-000000000000000a,lt-000000000000000b"
        );
        assert_eq!(annotations[TARGET_ANNOTATION], "recv:3100");
        assert_eq!(template.spec.as_ref().unwrap().containers.len(), 3);
    }

    #[test]
    fn test_remove_all_spec() {
        let mut d = deployment(
            "api-gw",
            "default",
            1,
            &[
                (TAPPED_ANNOTATION, "lt-a,lt-b"),
                (TARGET_ANNOTATION, "recv:3100"),
                (FORWARDER_ANNOTATION, "fluent-bit"),
            ],
        );
        // Simulate the injected containers.
        if let Some(spec) = d.spec.as_mut() {
            if let Some(pod_spec) = spec.template.spec.as_mut() {
                for session in ["lt-a", "lt-b"] {
                    pod_spec.containers.push(
                        k8s_openapi::api::core::v1::Container {
                            name: forwarder_container_name(session),
                            ..Default::default()
                        },
                    );
                }
            }
        }
        let workload = Workload::from_deployment(d).unwrap();
        let spec = build_remove_all_spec(&workload);
        assert_eq!(spec.container_names.len(), 2);
        assert_eq!(spec.volume_names.len(), 2);
        assert_eq!(spec.delete_annotations.len(), 5);
    }
}
