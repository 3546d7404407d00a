//! Self-permission probes and the forwarder log-reader role.

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;

use crate::manager::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::patch::best_effort_delete;

/// Name of the Role and RoleBinding granting forwarders log access.
pub const FORWARDER_ROLE_NAME: &str = "logtap-log-reader";

/// One permission to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbacCheck {
    pub resource: String,
    pub verb: String,
    pub group: String,
}

impl RbacCheck {
    pub fn new(resource: &str, verb: &str, group: &str) -> Self {
        Self {
            resource: resource.to_string(),
            verb: verb.to_string(),
            group: group.to_string(),
        }
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone)]
pub struct RbacCheckResult {
    pub check: RbacCheck,
    pub allowed: bool,
}

/// Permission probing and forwarder RBAC lifecycle.
#[derive(Clone)]
pub struct RbacAdvisor {
    client: Client,
}

impl RbacAdvisor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Run a `SelfSubjectAccessReview` per check and report the verdicts.
    pub async fn check_rbac(
        &self,
        namespace: &str,
        checks: &[RbacCheck],
    ) -> Result<Vec<RbacCheckResult>, kube::Error> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let review = SelfSubjectAccessReview {
                metadata: ObjectMeta::default(),
                spec: SelfSubjectAccessReviewSpec {
                    resource_attributes: Some(ResourceAttributes {
                        namespace: Some(namespace.to_string()),
                        resource: Some(check.resource.clone()),
                        verb: Some(check.verb.clone()),
                        group: Some(check.group.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                status: None,
            };
            let created = api.create(&PostParams::default(), &review).await?;
            let allowed = created.status.map(|s| s.allowed).unwrap_or(false);
            results.push(RbacCheckResult {
                check: check.clone(),
                allowed,
            });
        }
        Ok(results)
    }

    /// Create or update the namespace-scoped log-reader Role and bind the
    /// given service accounts to it. Existing binding subjects are kept;
    /// the union is deduplicated by name and namespace.
    pub async fn ensure_forwarder_rbac(
        &self,
        namespace: &str,
        service_accounts: &[String],
    ) -> Result<(), kube::Error> {
        let roles: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        let desired_role = forwarder_role(namespace);
        match roles.get(FORWARDER_ROLE_NAME).await {
            Ok(mut existing) => {
                existing.rules = desired_role.rules.clone();
                roles
                    .replace(FORWARDER_ROLE_NAME, &PostParams::default(), &existing)
                    .await?;
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                roles.create(&PostParams::default(), &desired_role).await?;
            }
            Err(e) => return Err(e),
        }

        let new_subjects: Vec<Subject> = service_accounts
            .iter()
            .map(|account| Subject {
                kind: "ServiceAccount".to_string(),
                name: account.clone(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            })
            .collect();

        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        match bindings.get(FORWARDER_ROLE_NAME).await {
            Ok(mut existing) => {
                let merged = union_subjects(existing.subjects.take().unwrap_or_default(), new_subjects);
                existing.subjects = Some(merged);
                bindings
                    .replace(FORWARDER_ROLE_NAME, &PostParams::default(), &existing)
                    .await?;
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                let binding = forwarder_role_binding(namespace, new_subjects);
                bindings.create(&PostParams::default(), &binding).await?;
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            namespace = %namespace,
            accounts = service_accounts.len(),
            "Forwarder log-reader RBAC ensured"
        );
        Ok(())
    }

    /// Best-effort removal of the Role and RoleBinding.
    pub async fn teardown_forwarder_rbac(&self, namespace: &str) -> Result<(), kube::Error> {
        let names = vec![FORWARDER_ROLE_NAME.to_string()];
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let binding_result = best_effort_delete(&bindings, &names).await;
        let roles: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        let role_result = best_effort_delete(&roles, &names).await;
        binding_result.and(role_result)
    }
}

fn forwarder_role(namespace: &str) -> Role {
    Role {
        metadata: managed_metadata(namespace),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string(), "pods/log".to_string()]),
            verbs: vec![
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
            ],
            ..Default::default()
        }]),
    }
}

fn forwarder_role_binding(namespace: &str, subjects: Vec<Subject>) -> RoleBinding {
    RoleBinding {
        metadata: managed_metadata(namespace),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: FORWARDER_ROLE_NAME.to_string(),
        },
        subjects: Some(subjects),
    }
}

fn managed_metadata(namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(FORWARDER_ROLE_NAME.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(
            [(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

/// Union of existing and new subjects, deduplicated by name+namespace.
fn union_subjects(existing: Vec<Subject>, new: Vec<Subject>) -> Vec<Subject> {
    let mut merged = existing;
    for subject in new {
        let duplicate = merged
            .iter()
            .any(|s| s.name == subject.name && s.namespace == subject.namespace);
        if !duplicate {
            merged.push(subject);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(name: &str, namespace: &str) -> Subject {
        Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_union_subjects_dedups_by_name_and_namespace() {
        let existing = vec![subject("default", "payments")];
        let new = vec![
            subject("default", "payments"),
            subject("default", "checkout"),
            subject("ingest", "payments"),
        ];
        let merged = union_subjects(existing, new);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].name, "default");
        assert_eq!(merged[1].namespace.as_deref(), Some("checkout"));
    }

    #[test]
    fn test_forwarder_role_grants_log_reads() {
        let role = forwarder_role("payments");
        let rules = role.rules.as_ref().unwrap();
        assert_eq!(rules.len(), 1);
        let resources = rules[0].resources.as_ref().unwrap();
        assert!(resources.contains(&"pods".to_string()));
        assert!(resources.contains(&"pods/log".to_string()));
        assert_eq!(rules[0].verbs, vec!["get", "list", "watch"]);
    }
}
