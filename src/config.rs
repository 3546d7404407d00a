//! Configuration records for the receiver pipeline and tap operations.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

/// Forwarder flavor injected into a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwarderFlavor {
    #[default]
    Logtap,
    FluentBit,
}

impl ForwarderFlavor {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "logtap" => Some(Self::Logtap),
            "fluent-bit" => Some(Self::FluentBit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logtap => "logtap",
            Self::FluentBit => "fluent-bit",
        }
    }
}

/// Sidecar resource requests and limits, as Kubernetes quantities.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SidecarResources {
    pub mem_request: String,
    pub mem_limit: String,
    pub cpu_request: String,
    pub cpu_limit: String,
}

impl Default for SidecarResources {
    fn default() -> Self {
        Self {
            mem_request: "16Mi".to_string(),
            mem_limit: "32Mi".to_string(),
            cpu_request: "25m".to_string(),
            cpu_limit: "50m".to_string(),
        }
    }
}

/// Everything one `inject` needs to know.
#[derive(Debug, Clone)]
pub struct TapConfig {
    /// Session identifier (`lt-<16 hex>`).
    pub session: String,
    /// Receiver address written into `logtap.dev/target`, `host:port`.
    pub target: String,
    pub flavor: ForwarderFlavor,
    /// Forwarder image; required for the Fluent-Bit flavor.
    pub image: Option<String>,
    pub resources: SidecarResources,
}

/// Receiver pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Ingest listen address.
    pub listen: SocketAddr,
    /// Capture directory.
    pub dir: PathBuf,
    /// Rotate when the active file would exceed this many bytes.
    pub max_file: u64,
    /// Disk cap for the capture directory; 0 disables it.
    pub max_disk: u64,
    /// Compress rotated files.
    pub compress: bool,
    /// Writer queue capacity in entries.
    pub queue: usize,
    /// Live ring capacity in entries; 0 selects the default.
    pub ring_capacity: usize,
    /// Enable redaction.
    pub redact: bool,
    /// Builtin pattern names to load; empty selects all builtins.
    pub redact_patterns: Vec<String>,
    /// Optional YAML file with extra redaction patterns.
    pub custom_pattern_file: Option<PathBuf>,
    /// Optional YAML file with alert rules.
    pub alert_rules_file: Option<PathBuf>,
    /// Seconds between alert evaluations.
    pub alert_interval_secs: u64,
    /// Webhook destinations; empty disables delivery.
    pub webhook_urls: Vec<String>,
    /// `""`, `bearer:<token>`, or `hmac-sha256:<secret>`.
    pub webhook_auth: String,
    /// Event names to deliver; empty delivers everything.
    pub webhook_events: Vec<String>,
    /// Write an audit.jsonl alongside the capture.
    pub audit: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3100)),
            dir: PathBuf::from("./capture"),
            max_file: 64 * 1024 * 1024,
            max_disk: 1024 * 1024 * 1024,
            compress: true,
            queue: 8192,
            ring_capacity: 0,
            redact: true,
            redact_patterns: Vec::new(),
            custom_pattern_file: None,
            alert_rules_file: None,
            alert_interval_secs: 10,
            webhook_urls: Vec::new(),
            webhook_auth: String::new(),
            webhook_events: Vec::new(),
            audit: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavor_parse() {
        assert_eq!(ForwarderFlavor::parse("logtap"), Some(ForwarderFlavor::Logtap));
        assert_eq!(
            ForwarderFlavor::parse("fluent-bit"),
            Some(ForwarderFlavor::FluentBit)
        );
        assert_eq!(ForwarderFlavor::parse("vector"), None);
    }

    #[test]
    fn test_defaults() {
        let cfg = ReceiverConfig::default();
        assert_eq!(cfg.listen.port(), 3100);
        assert!(cfg.compress);
        assert_eq!(cfg.queue, 8192);

        let res = SidecarResources::default();
        assert_eq!(res.mem_request, "16Mi");
        assert_eq!(res.cpu_limit, "50m");
    }
}
