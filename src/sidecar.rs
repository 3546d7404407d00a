//! Forwarder sidecar container specs, Fluent-Bit configuration, and
//! service-mesh bypass annotations.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, ExecAction, HTTPGetAction,
    HostPathVolumeSource, Lifecycle, LifecycleHandler, ObjectFieldSelector, Probe,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::{ForwarderFlavor, SidecarResources, TapConfig};
use crate::session::forwarder_container_name;

/// Default LogTap forwarder image.
pub const DEFAULT_FORWARDER_IMAGE: &str = "ghcr.io/logtap/forwarder:latest";

/// Port the forwarder serves its liveness probe on.
pub const FORWARDER_HEALTH_PORT: i32 = 8089;

/// Volume names shared by Fluent-Bit sidecars in one pod template.
pub const FLUENT_BIT_CONFIG_VOLUME: &str = "logtap-fb-config";
pub const FLUENT_BIT_VARLOG_VOLUME: &str = "logtap-varlog";

/// Mesh annotation keys LogTap writes (and cleans up on remove-all).
pub const LINKERD_SKIP_PORTS: &str = "config.linkerd.io/skip-outbound-ports";
pub const ISTIO_EXCLUDE_PORTS: &str = "traffic.sidecar.istio.io/excludeOutboundPorts";

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("the fluent-bit forwarder flavor requires an image")]
    ImageRequired,
}

/// Name of the per-session Fluent-Bit ConfigMap.
pub fn fluent_bit_configmap_name(session: &str) -> String {
    format!("logtap-fb-{session}")
}

/// Build the forwarder container for `cfg`'s flavor.
pub fn forwarder_container(cfg: &TapConfig) -> Result<Container, SidecarError> {
    match cfg.flavor {
        ForwarderFlavor::Logtap => Ok(logtap_container(cfg)),
        ForwarderFlavor::FluentBit => fluent_bit_container(cfg),
    }
}

fn logtap_container(cfg: &TapConfig) -> Container {
    Container {
        name: forwarder_container_name(&cfg.session),
        image: Some(
            cfg.image
                .clone()
                .unwrap_or_else(|| DEFAULT_FORWARDER_IMAGE.to_string()),
        ),
        env: Some(vec![
            EnvVar {
                name: "LOGTAP_TARGET".to_string(),
                value: Some(cfg.target.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "LOGTAP_SESSION".to_string(),
                value: Some(cfg.session.clone()),
                ..Default::default()
            },
            field_ref_env("LOGTAP_POD_NAME", "metadata.name"),
            field_ref_env("LOGTAP_NAMESPACE", "metadata.namespace"),
        ]),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(FORWARDER_HEALTH_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        lifecycle: Some(drain_pre_stop()),
        resources: Some(resource_requirements(&cfg.resources)),
        ..Default::default()
    }
}

fn fluent_bit_container(cfg: &TapConfig) -> Result<Container, SidecarError> {
    let image = cfg.image.clone().ok_or(SidecarError::ImageRequired)?;
    Ok(Container {
        name: forwarder_container_name(&cfg.session),
        image: Some(image),
        args: Some(vec![
            "fluent-bit".to_string(),
            "-c".to_string(),
            "/fluent-bit/etc/fluent-bit.conf".to_string(),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: FLUENT_BIT_CONFIG_VOLUME.to_string(),
                mount_path: "/fluent-bit/etc".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: FLUENT_BIT_VARLOG_VOLUME.to_string(),
                mount_path: "/var/log/pods".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(FORWARDER_HEALTH_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        lifecycle: Some(drain_pre_stop()),
        resources: Some(resource_requirements(&cfg.resources)),
        ..Default::default()
    })
}

/// The two volumes backing a Fluent-Bit sidecar: the session ConfigMap
/// and the node's pod log directory.
pub fn fluent_bit_volumes(session: &str) -> Vec<Volume> {
    vec![
        Volume {
            name: FLUENT_BIT_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(fluent_bit_configmap_name(session)),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: FLUENT_BIT_VARLOG_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/var/log/pods".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

pub fn fluent_bit_volume_names() -> Vec<String> {
    vec![
        FLUENT_BIT_CONFIG_VOLUME.to_string(),
        FLUENT_BIT_VARLOG_VOLUME.to_string(),
    ]
}

/// Render the Fluent-Bit configuration tailing the namespace's pod logs
/// and shipping them to the receiver's Loki endpoint.
pub fn fluent_bit_config(namespace: &str, session: &str, target: &str) -> String {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => (target, "3100"),
    };
    format!(
        "[SERVICE]\n\
         \x20   Flush        1\n\
         \x20   Log_Level    info\n\
         \n\
         [INPUT]\n\
         \x20   Name         tail\n\
         \x20   Path         /var/log/pods/{namespace}_*/*/*.log\n\
         \x20   Tag          logtap.*\n\
         \x20   Read_from_Head Off\n\
         \n\
         [FILTER]\n\
         \x20   Name         record_modifier\n\
         \x20   Match        *\n\
         \x20   Record       session {session}\n\
         \n\
         [OUTPUT]\n\
         \x20   Name         loki\n\
         \x20   Match        *\n\
         \x20   Host         {host}\n\
         \x20   Port         {port}\n\
         \x20   Labels       job=logtap, session={session}\n"
    )
}

/// Mesh bypass annotations for a pod already under Linkerd or Istio
/// injection: union the receiver port into the mesh's outbound-skip
/// list so forwarder traffic does not transit the mesh proxy.
///
/// Returns only the annotations to write; an empty port yields none.
/// Idempotent: a port already present is not duplicated.
pub fn mesh_bypass_annotations(
    existing: &BTreeMap<String, String>,
    port: &str,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if port.is_empty() {
        return out;
    }

    let linkerd_injected = existing
        .get("linkerd.io/inject")
        .map(|v| v == "enabled")
        .unwrap_or(false);
    if linkerd_injected {
        out.insert(
            LINKERD_SKIP_PORTS.to_string(),
            union_port_list(existing.get(LINKERD_SKIP_PORTS), port),
        );
    }

    let istio_injected = existing
        .get("sidecar.istio.io/inject")
        .map(|v| v == "true")
        .unwrap_or(false)
        || existing.contains_key("istio.io/rev");
    if istio_injected {
        out.insert(
            ISTIO_EXCLUDE_PORTS.to_string(),
            union_port_list(existing.get(ISTIO_EXCLUDE_PORTS), port),
        );
    }

    out
}

/// Mesh annotation keys to delete when the last session leaves.
pub fn mesh_bypass_keys() -> Vec<String> {
    vec![LINKERD_SKIP_PORTS.to_string(), ISTIO_EXCLUDE_PORTS.to_string()]
}

/// Extract the port of a `host:port` target.
pub fn port_of(target: &str) -> String {
    target
        .rsplit_once(':')
        .map(|(_, port)| port.to_string())
        .unwrap_or_default()
}

fn union_port_list(existing: Option<&String>, port: &str) -> String {
    let mut ports: Vec<String> = existing
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if !ports.iter().any(|p| p == port) {
        ports.push(port.to_string());
    }
    ports.join(",")
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `sleep 5` before termination so in-flight pushes drain.
fn drain_pre_stop() -> Lifecycle {
    Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()]),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resource_requirements(resources: &SidecarResources) -> ResourceRequirements {
    let quantities = |mem: &str, cpu: &str| {
        let mut map = BTreeMap::new();
        map.insert("memory".to_string(), Quantity(mem.to_string()));
        map.insert("cpu".to_string(), Quantity(cpu.to_string()));
        map
    };
    ResourceRequirements {
        requests: Some(quantities(&resources.mem_request, &resources.cpu_request)),
        limits: Some(quantities(&resources.mem_limit, &resources.cpu_limit)),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap_config(flavor: ForwarderFlavor, image: Option<&str>) -> TapConfig {
        TapConfig {
            session: "lt-0000000000000001".to_string(),
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
    fn test_logtap_container_shape() {
        let c = forwarder_container(&tap_config(ForwarderFlavor::Logtap, None)).unwrap();
        assert_eq!(c.name, "logtap-forwarder-lt-0000000000000001");
        assert_eq!(c.image.as_deref(), Some(DEFAULT_FORWARDER_IMAGE));

        let env = c.env.as_ref().unwrap();
        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["LOGTAP_TARGET", "LOGTAP_SESSION", "LOGTAP_POD_NAME", "LOGTAP_NAMESPACE"]
        );
        assert_eq!(env[0].value.as_deref(), Some("recv:3100"));
        assert_eq!(
            env[2].value_from.as_ref().unwrap().field_ref.as_ref().unwrap().field_path,
            "metadata.name"
        );

        let probe = c.liveness_probe.as_ref().unwrap();
        assert_eq!(probe.initial_delay_seconds, Some(5));
        assert_eq!(probe.period_seconds, Some(10));
        assert_eq!(
            probe.http_get.as_ref().unwrap().port,
            IntOrString::Int(FORWARDER_HEALTH_PORT)
        );

        let requests = c.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests["memory"].0, "16Mi");
        assert_eq!(requests["cpu"].0, "25m");
    }

    #[test]
    fn test_fluent_bit_requires_image() {
        let err = forwarder_container(&tap_config(ForwarderFlavor::FluentBit, None)).unwrap_err();
        assert!(matches!(err, SidecarError::ImageRequired));
    }

    #[test]
    fn test_fluent_bit_container_mounts() {
        let c = forwarder_container(&tap_config(
            ForwarderFlavor::FluentBit,
            Some("fluent/fluent-bit:3.0"),
        ))
        .unwrap();
        let mounts = c.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].name, FLUENT_BIT_CONFIG_VOLUME);
        assert_eq!(mounts[0].mount_path, "/fluent-bit/etc");
        assert_eq!(mounts[1].mount_path, "/var/log/pods");
        assert!(mounts.iter().all(|m| m.read_only == Some(true)));
        assert_eq!(
            c.args.as_ref().unwrap()[2],
            "/fluent-bit/etc/fluent-bit.conf"
        );
    }

    #[test]
    fn test_fluent_bit_volumes_reference_session_configmap() {
        let volumes = fluent_bit_volumes("lt-00000000000000ab");
        assert_eq!(volumes[0].name, FLUENT_BIT_CONFIG_VOLUME);
        assert_eq!(
            volumes[0].config_map.as_ref().unwrap().name.as_deref(),
            Some("logtap-fb-lt-00000000000000ab")
        );
        assert_eq!(
            volumes[1].host_path.as_ref().unwrap().path,
            "/var/log/pods"
        );
    }

    #[test]
    fn test_fluent_bit_config_render() {
        let conf = fluent_bit_config("payments", "lt-00000000000000ab", "recv.logtap:3100");
        assert!(conf.contains("Path         /var/log/pods/payments_*/*/*.log"));
        assert!(conf.contains("Record       session lt-00000000000000ab"));
        assert!(conf.contains("Host         recv.logtap"));
        assert!(conf.contains("Port         3100"));
    }

    #[test]
    fn test_mesh_bypass_linkerd() {
        let existing = annotations(&[("linkerd.io/inject", "enabled")]);
        let out = mesh_bypass_annotations(&existing, "3100");
        assert_eq!(out[LINKERD_SKIP_PORTS], "3100");
        assert!(!out.contains_key(ISTIO_EXCLUDE_PORTS));
    }

    #[test]
    fn test_mesh_bypass_istio_by_inject_or_rev() {
        let by_inject = annotations(&[("sidecar.istio.io/inject", "true")]);
        assert_eq!(
            mesh_bypass_annotations(&by_inject, "3100")[ISTIO_EXCLUDE_PORTS],
            "3100"
        );
        let by_rev = annotations(&[("istio.io/rev", "1-21-0")]);
        assert_eq!(
            mesh_bypass_annotations(&by_rev, "3100")[ISTIO_EXCLUDE_PORTS],
            "3100"
        );
    }

    #[test]
    fn test_mesh_bypass_unions_and_dedupes() {
        let existing = annotations(&[
            ("linkerd.io/inject", "enabled"),
            (LINKERD_SKIP_PORTS, "443, 9200"),
        ]);
        let out = mesh_bypass_annotations(&existing, "3100");
        assert_eq!(out[LINKERD_SKIP_PORTS], "443,9200,3100");

        // Applying the result again adds nothing.
        let mut second = existing.clone();
        second.insert(LINKERD_SKIP_PORTS.to_string(), out[LINKERD_SKIP_PORTS].clone());
        let again = mesh_bypass_annotations(&second, "3100");
        assert_eq!(again[LINKERD_SKIP_PORTS], "443,9200,3100");
    }

    #[test]
    fn test_mesh_bypass_empty_port_or_no_mesh() {
        let meshed = annotations(&[("linkerd.io/inject", "enabled")]);
        assert!(mesh_bypass_annotations(&meshed, "").is_empty());
        let unmeshed = annotations(&[("team", "payments")]);
        assert!(mesh_bypass_annotations(&unmeshed, "3100").is_empty());
    }

    #[test]
    fn test_port_of() {
        assert_eq!(port_of("recv:3100"), "3100");
        assert_eq!(port_of("bare-host"), "");
    }
}
