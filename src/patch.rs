//! Pod-template patching with optimistic concurrency.
//!
//! The template mutation itself is pure (`apply_to_template`,
//! `remove_from_template`); the engine wraps it in a read-mutate-replace
//! cycle against the live object. Conflicts surface to the caller: the
//! retry budget lives in the session manager, which is the only layer
//! that can re-derive the mutation from a freshly read object.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec, Volume};
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::workload::WorkloadKind;

/// Everything one sidecar injection adds to a pod template.
#[derive(Debug, Clone)]
pub struct PatchSpec {
    pub container: Container,
    pub volumes: Vec<Volume>,
    pub annotations: BTreeMap<String, String>,
}

/// The inverse: what a removal strips from a pod template.
#[derive(Debug, Clone, Default)]
pub struct RemovePatchSpec {
    pub container_names: Vec<String>,
    pub volume_names: Vec<String>,
    pub set_annotations: BTreeMap<String, String>,
    pub delete_annotations: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("{kind} {namespace}/{name} has no pod template")]
    MissingTemplate {
        kind: WorkloadKind,
        name: String,
        namespace: String,
    },
    #[error("conflict updating {kind} {namespace}/{name}: object has been modified")]
    Conflict {
        kind: WorkloadKind,
        name: String,
        namespace: String,
    },
    #[error(transparent)]
    Api(#[from] kube::Error),
}

impl PatchError {
    /// Whether a retry with a freshly read object could succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PatchError::Conflict { .. })
    }
}

/// Workload kinds the engine can patch, with access to their pod
/// template.
pub trait HasPodTemplate:
    kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + DeserializeOwned
    + Serialize
    + fmt::Debug
{
    fn pod_template(&self) -> Option<&PodTemplateSpec>;
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;
}

impl HasPodTemplate for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl HasPodTemplate for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl HasPodTemplate for DaemonSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

/// Applies and removes sidecar patches against live workloads.
#[derive(Clone)]
pub struct PatchEngine {
    client: Client,
}

impl PatchEngine {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Read the live object, apply `spec` to its pod template, and update
    /// it. Returns a human-readable diff of the template change; dry-run
    /// returns the diff without writing.
    pub async fn apply(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
        spec: &PatchSpec,
        dry_run: bool,
    ) -> Result<String, PatchError> {
        let mutate = |template: &mut PodTemplateSpec| apply_to_template(template, spec);
        self.dispatch(kind, name, namespace, &mutate, dry_run).await
    }

    /// The removal counterpart of [`apply`](Self::apply).
    pub async fn remove(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
        spec: &RemovePatchSpec,
        dry_run: bool,
    ) -> Result<String, PatchError> {
        let mutate = |template: &mut PodTemplateSpec| remove_from_template(template, spec);
        self.dispatch(kind, name, namespace, &mutate, dry_run).await
    }

    async fn dispatch(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
        mutate: &(dyn Fn(&mut PodTemplateSpec) + Sync),
        dry_run: bool,
    ) -> Result<String, PatchError> {
        match kind {
            WorkloadKind::Deployment => {
                self.mutate_typed::<Deployment>(kind, name, namespace, mutate, dry_run)
                    .await
            }
            WorkloadKind::StatefulSet => {
                self.mutate_typed::<StatefulSet>(kind, name, namespace, mutate, dry_run)
                    .await
            }
            WorkloadKind::DaemonSet => {
                self.mutate_typed::<DaemonSet>(kind, name, namespace, mutate, dry_run)
                    .await
            }
        }
    }

    async fn mutate_typed<K: HasPodTemplate>(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
        mutate: &(dyn Fn(&mut PodTemplateSpec) + Sync),
        dry_run: bool,
    ) -> Result<String, PatchError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let live = api.get(name).await?;
        let mut updated = live.clone();
        let template = updated
            .pod_template_mut()
            .ok_or_else(|| PatchError::MissingTemplate {
                kind,
                name: name.to_string(),
                namespace: namespace.to_string(),
            })?;
        mutate(template);

        let diff = template_diff(live.pod_template(), updated.pod_template());
        if dry_run {
            return Ok(diff);
        }

        match api.replace(name, &PostParams::default(), &updated).await {
            Ok(_) => Ok(diff),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(PatchError::Conflict {
                    kind,
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Append the container and volumes (skipping names already present) and
/// union the annotations into the template.
pub fn apply_to_template(template: &mut PodTemplateSpec, spec: &PatchSpec) {
    let pod_spec = template.spec.get_or_insert_with(Default::default);

    if !pod_spec
        .containers
        .iter()
        .any(|c| c.name == spec.container.name)
    {
        pod_spec.containers.push(spec.container.clone());
    }

    if !spec.volumes.is_empty() {
        let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
        for volume in &spec.volumes {
            if !volumes.iter().any(|v| v.name == volume.name) {
                volumes.push(volume.clone());
            }
        }
    }

    if !spec.annotations.is_empty() {
        let metadata = template.metadata.get_or_insert_with(Default::default);
        let annotations = metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in &spec.annotations {
            annotations.insert(key.clone(), value.clone());
        }
    }
}

/// Filter out the named containers and volumes, then set and delete
/// annotation keys.
pub fn remove_from_template(template: &mut PodTemplateSpec, spec: &RemovePatchSpec) {
    if let Some(pod_spec) = template.spec.as_mut() {
        pod_spec
            .containers
            .retain(|c| !spec.container_names.contains(&c.name));
        if let Some(volumes) = pod_spec.volumes.as_mut() {
            volumes.retain(|v| !spec.volume_names.contains(&v.name));
            if volumes.is_empty() {
                pod_spec.volumes = None;
            }
        }
    }

    if let Some(metadata) = template.metadata.as_mut() {
        if let Some(annotations) = metadata.annotations.as_mut() {
            for (key, value) in &spec.set_annotations {
                annotations.insert(key.clone(), value.clone());
            }
            for key in &spec.delete_annotations {
                annotations.remove(key);
            }
            if annotations.is_empty() {
                metadata.annotations = None;
            }
        }
    } else if !spec.set_annotations.is_empty() {
        let metadata = template.metadata.get_or_insert_with(Default::default);
        metadata.annotations = Some(spec.set_annotations.clone());
    }
}

/// Line-set difference of the canonicalized templates: `-` lines are
/// gone, `+` lines are new. Sufficient for human review; ordering-only
/// changes do not show up.
pub fn template_diff(before: Option<&PodTemplateSpec>, after: Option<&PodTemplateSpec>) -> String {
    let before = canonical_lines(before);
    let after = canonical_lines(after);
    let before_set: BTreeSet<&str> = before.iter().map(String::as_str).collect();
    let after_set: BTreeSet<&str> = after.iter().map(String::as_str).collect();

    let mut out = String::new();
    for line in &before {
        if !after_set.contains(line.as_str()) {
            out.push_str("- ");
            out.push_str(line);
            out.push('\n');
        }
    }
    for line in &after {
        if !before_set.contains(line.as_str()) {
            out.push_str("+ ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn canonical_lines(template: Option<&PodTemplateSpec>) -> Vec<String> {
    let Some(template) = template else {
        return Vec::new();
    };
    serde_json::to_string_pretty(template)
        .map(|text| text.lines().map(|l| l.trim().to_string()).collect())
        .unwrap_or_default()
}

/// Delete several objects best-effort: not-found is swallowed, other
/// failures are logged and the first is returned after every deletion has
/// been attempted.
pub async fn best_effort_delete<K>(api: &Api<K>, names: &[String]) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + DeserializeOwned + fmt::Debug,
    K::DynamicType: Default,
{
    let mut first_error = None;
    for name in names {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(e) => {
                tracing::warn!(object = %name, error = %e, "Best-effort delete failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::test_fixtures::deployment;
    use crate::workload::{TAPPED_ANNOTATION, TARGET_ANNOTATION};

    fn sample_patch() -> PatchSpec {
        PatchSpec {
            container: Container {
                name: "logtap-forwarder-lt-0000000000000001".to_string(),
                image: Some("ghcr.io/logtap/forwarder:latest".to_string()),
                ..Default::default()
            },
            volumes: vec![Volume {
                name: "logtap-fb-config".to_string(),
                ..Default::default()
            }],
            annotations: [
                (TAPPED_ANNOTATION.to_string(), "lt-0000000000000001".to_string()),
                (TARGET_ANNOTATION.to_string(), "recv:3100".to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn template_of(d: &Deployment) -> PodTemplateSpec {
        d.spec.as_ref().map(|s| s.template.clone()).unwrap_or_default()
    }

    #[test]
    fn test_apply_adds_container_volume_annotations() {
        let d = deployment("api-gw", "default", 1, &[]);
        let mut template = template_of(&d);
        apply_to_template(&mut template, &sample_patch());

        let spec = template.spec.as_ref().unwrap();
        let names: Vec<_> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["app", "logtap-forwarder-lt-0000000000000001"]);
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 1);
        let annotations = template.metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert_eq!(annotations[TARGET_ANNOTATION], "recv:3100");
    }

    #[test]
    fn test_apply_is_idempotent_for_existing_names() {
        let d = deployment("api-gw", "default", 1, &[]);
        let mut template = template_of(&d);
        apply_to_template(&mut template, &sample_patch());
        apply_to_template(&mut template, &sample_patch());

        let spec = template.spec.as_ref().unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_undoes_apply() {
        let d = deployment("api-gw", "default", 1, &[]);
        let original = template_of(&d);
        let mut template = original.clone();
        apply_to_template(&mut template, &sample_patch());

        remove_from_template(
            &mut template,
            &RemovePatchSpec {
                container_names: vec!["logtap-forwarder-lt-0000000000000001".to_string()],
                volume_names: vec!["logtap-fb-config".to_string()],
                set_annotations: BTreeMap::new(),
                delete_annotations: vec![
                    TAPPED_ANNOTATION.to_string(),
                    TARGET_ANNOTATION.to_string(),
                ],
            },
        );

        assert_eq!(template_diff(Some(&original), Some(&template)), "");
    }

    #[test]
    fn test_remove_rewrites_annotations() {
        let d = deployment(
            "api-gw",
            "default",
            1,
            &[(TAPPED_ANNOTATION, "lt-a,lt-b"), (TARGET_ANNOTATION, "recv:3100")],
        );
        let mut template = template_of(&d);
        remove_from_template(
            &mut template,
            &RemovePatchSpec {
                container_names: vec!["logtap-forwarder-lt-b".to_string()],
                set_annotations: [(TAPPED_ANNOTATION.to_string(), "lt-a".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        );
        let annotations = template.metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert_eq!(annotations[TAPPED_ANNOTATION], "lt-a");
        assert_eq!(annotations[TARGET_ANNOTATION], "recv:3100");
    }

    #[test]
    fn test_diff_shows_additions_and_removals() {
        let d = deployment("api-gw", "default", 1, &[]);
        let before = template_of(&d);
        let mut after = before.clone();
        apply_to_template(&mut after, &sample_patch());

        let diff = template_diff(Some(&before), Some(&after));
        assert!(diff
            .lines()
            .any(|l| l.starts_with("+ ") && l.contains("logtap-forwarder-lt-0000000000000001")));
        assert!(!diff
            .lines()
            .any(|l| l.starts_with("- ") && l.contains("\"app\"")));
    }

    #[test]
    fn test_diff_identical_templates_is_empty() {
        let d = deployment("api-gw", "default", 1, &[]);
        let template = template_of(&d);
        assert_eq!(template_diff(Some(&template), Some(&template)), "");
    }
}
