//! Threshold alerting over pipeline snapshots.
//!
//! The caller drives the cadence: each `evaluate` call is one tick against
//! a fresh snapshot. Rules fire once on crossing and stay latched until an
//! evaluation observes the condition resolved (hysteresis), so a
//! continuously bad metric produces one event, not one per tick.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::stats::StatsSnapshot;
use crate::webhook::WebhookEvent;

/// Metric a rule evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    LogsDropped,
    DropRate,
    DiskPct,
    LogsReceived,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertOp {
    Gt,
    Lt,
    Gte,
    Lte,
}

/// One threshold rule.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: AlertMetric,
    pub op: AlertOp,
    pub threshold: f64,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<AlertRule>,
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed rules file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("alert rule #{index} has no name")]
    UnnamedRule { index: usize },
}

/// Load rules from a YAML file (`rules: [{name, metric, op, threshold,
/// detail}]`). Metric and op values are validated by deserialization;
/// every rule must carry a name.
pub fn load_rules(path: &Path) -> Result<Vec<AlertRule>, AlertError> {
    let content = fs::read_to_string(path)?;
    let file: RuleFile = serde_yaml::from_str(&content)?;
    for (index, rule) in file.rules.iter().enumerate() {
        if rule.name.is_empty() {
            return Err(AlertError::UnnamedRule { index });
        }
    }
    Ok(file.rules)
}

/// Evaluates rules per tick and emits webhook events on crossings.
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    fired: HashSet<String>,
    prev_dropped: Option<u64>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            fired: HashSet::new(),
            prev_dropped: None,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate every rule against `snap` and return the events that fired
    /// this tick. The caller hands them to the webhook dispatcher.
    pub fn evaluate(&mut self, snap: &StatsSnapshot) -> Vec<WebhookEvent> {
        let drop_rate = match self.prev_dropped {
            Some(prev) => snap.logs_dropped.saturating_sub(prev),
            None => 0,
        };
        self.prev_dropped = Some(snap.logs_dropped);

        let disk_pct = if snap.disk_cap > 0 {
            snap.disk_usage as f64 * 100.0 / snap.disk_cap as f64
        } else {
            0.0
        };

        let mut events = Vec::new();
        for rule in &self.rules {
            let value = match rule.metric {
                AlertMetric::LogsDropped => snap.logs_dropped as f64,
                AlertMetric::DropRate => drop_rate as f64,
                AlertMetric::DiskPct => disk_pct,
                AlertMetric::LogsReceived => snap.logs_received as f64,
            };
            let breached = match rule.op {
                AlertOp::Gt => value > rule.threshold,
                AlertOp::Lt => value < rule.threshold,
                AlertOp::Gte => value >= rule.threshold,
                AlertOp::Lte => value <= rule.threshold,
            };
            if breached {
                if !self.fired.contains(&rule.name) {
                    self.fired.insert(rule.name.clone());
                    let detail = if rule.detail.is_empty() {
                        format!("{} crossed threshold {} (value {value:.1})", rule.name, rule.threshold)
                    } else {
                        rule.detail.clone()
                    };
                    tracing::info!(rule = %rule.name, value, "Alert fired");
                    events.push(WebhookEvent::named("alert").with_detail(detail));
                }
            } else if self.fired.remove(&rule.name) {
                tracing::info!(rule = %rule.name, value, "Alert resolved");
            }
        }
        events
    }
}
