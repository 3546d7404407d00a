//! Pre-flight resource checks and production-namespace detection.
//!
//! Everything here returns warnings, not errors: a missing quota or an
//! unreadable node list degrades the advice, never the tap operation.

use k8s_openapi::api::core::v1::{LimitRange, Namespace, Node, ResourceQuota};
use kube::api::{Api, ListParams};
use kube::Client;

/// Advises on sidecar feasibility before a tap mutates anything.
#[derive(Clone)]
pub struct ResourceAdvisor {
    client: Client,
}

impl ResourceAdvisor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Check namespace quotas, limit ranges, and node pressure against
    /// `replicas` sidecars requesting `mem_req`/`cpu_req` each.
    pub async fn check_resources(
        &self,
        namespace: &str,
        replicas: i32,
        mem_req: &str,
        cpu_req: &str,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        let replicas = replicas.max(0) as f64;
        let mem_req_bytes = parse_quantity(mem_req).unwrap_or(0.0);
        let cpu_req_cores = parse_quantity(cpu_req).unwrap_or(0.0);

        self.check_quotas(
            namespace,
            replicas,
            mem_req_bytes,
            cpu_req_cores,
            &mut warnings,
        )
        .await;
        self.check_limit_ranges(namespace, mem_req_bytes, cpu_req_cores, &mut warnings)
            .await;
        self.check_node_pressure(&mut warnings).await;
        warnings
    }

    async fn check_quotas(
        &self,
        namespace: &str,
        replicas: f64,
        mem_req: f64,
        cpu_req: f64,
        warnings: &mut Vec<String>,
    ) {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let quotas = match api.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warnings.push(format!("could not check resource quotas: {e}"));
                return;
            }
        };
        for quota in quotas {
            let name = quota.metadata.name.as_deref().unwrap_or("?").to_string();
            let Some(status) = quota.status else {
                continue;
            };
            let (Some(hard), Some(used)) = (status.hard, status.used) else {
                continue;
            };
            for (resource, added) in [
                ("requests.memory", mem_req * replicas),
                ("memory", mem_req * replicas),
                ("requests.cpu", cpu_req * replicas),
                ("cpu", cpu_req * replicas),
            ] {
                let Some(hard_q) = hard.get(resource).and_then(|q| parse_quantity(&q.0)) else {
                    continue;
                };
                let used_q = used
                    .get(resource)
                    .and_then(|q| parse_quantity(&q.0))
                    .unwrap_or(0.0);
                if used_q + added > hard_q {
                    warnings.push(format!(
                        "quota {name}: {resource} would exceed the hard limit \
                         (used {used_q:.0} + sidecars {added:.0} > {hard_q:.0})"
                    ));
                }
            }
        }
    }

    async fn check_limit_ranges(
        &self,
        namespace: &str,
        mem_req: f64,
        cpu_req: f64,
        warnings: &mut Vec<String>,
    ) {
        let api: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
        let ranges = match api.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warnings.push(format!("could not check limit ranges: {e}"));
                return;
            }
        };
        for range in ranges {
            let name = range.metadata.name.as_deref().unwrap_or("?").to_string();
            let Some(spec) = range.spec else {
                continue;
            };
            for item in spec.limits {
                if item.type_ != "Container" {
                    continue;
                }
                let Some(max) = item.max else {
                    continue;
                };
                if let Some(max_mem) = max.get("memory").and_then(|q| parse_quantity(&q.0)) {
                    if max_mem < mem_req {
                        warnings.push(format!(
                            "limit range {name}: container memory max {max_mem:.0} is below \
                             the sidecar request {mem_req:.0}"
                        ));
                    }
                }
                if let Some(max_cpu) = max.get("cpu").and_then(|q| parse_quantity(&q.0)) {
                    if max_cpu < cpu_req {
                        warnings.push(format!(
                            "limit range {name}: container cpu max {max_cpu:.3} is below \
                             the sidecar request {cpu_req:.3}"
                        ));
                    }
                }
            }
        }
    }

    async fn check_node_pressure(&self, warnings: &mut Vec<String>) {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = match api.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warnings.push(format!("could not check node pressure: {e}"));
                return;
            }
        };
        for node in nodes {
            let name = node.metadata.name.as_deref().unwrap_or("?").to_string();
            let Some(conditions) = node.status.and_then(|s| s.conditions) else {
                continue;
            };
            for condition in conditions {
                if (condition.type_ == "MemoryPressure" || condition.type_ == "DiskPressure")
                    && condition.status == "True"
                {
                    warnings.push(format!("node {name} reports {}", condition.type_));
                }
            }
        }
    }

    /// Whether `namespace` looks like production: `env`/`environment`
    /// labels with a prod value, or the explicit `logtap.dev/prod=true`.
    pub async fn is_prod_namespace(&self, namespace: &str) -> Result<bool, kube::Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api.get(namespace).await?;
        let labels = ns.metadata.labels.unwrap_or_default();
        for key in ["env", "environment"] {
            if let Some(value) = labels.get(key) {
                if value == "prod" || value == "production" {
                    return Ok(true);
                }
            }
        }
        Ok(labels.get("logtap.dev/prod").map(String::as_str) == Some("true"))
    }
}

/// Parse a Kubernetes quantity into base units: bytes for memory
/// quantities, cores for CPU (`m` suffix is millicores).
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }
    let suffixes: [(&str, f64); 9] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];
    for (suffix, factor) in suffixes {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    if let Some(milli) = quantity.strip_suffix('m') {
        return milli.parse::<f64>().ok().map(|n| n / 1000.0);
    }
    quantity.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity_memory() {
        assert_eq!(parse_quantity("16Mi"), Some(16.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity("1Gi"), Some(1024.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity("512Ki"), Some(512.0 * 1024.0));
        assert_eq!(parse_quantity("1000"), Some(1000.0));
        assert_eq!(parse_quantity("2G"), Some(2e9));
    }

    #[test]
    fn test_parse_quantity_cpu() {
        assert_eq!(parse_quantity("25m"), Some(0.025));
        assert_eq!(parse_quantity("2"), Some(2.0));
        assert_eq!(parse_quantity("1500m"), Some(1.5));
    }

    #[test]
    fn test_parse_quantity_rejects_garbage() {
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("lots"), None);
        assert_eq!(parse_quantity("Mi"), None);
    }
}
