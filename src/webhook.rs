//! Fire-and-forget webhook delivery with optional request signing.
//!
//! Delivery semantics are deliberately weak: one background task per URL,
//! a fixed 5 second budget, and no retries. Anything stronger belongs to
//! the system consuming the webhook.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

/// Total per-request delivery budget.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Signature header for HMAC-signed deliveries.
const SIGNATURE_HEADER: &str = "X-Logtap-Signature";

/// Pipeline figures attached to lifecycle events.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookStats {
    pub lines_written: u64,
    pub bytes_written: u64,
    pub disk_usage: u64,
    pub disk_cap: u64,
}

/// The JSON payload POSTed to each configured URL.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<WebhookStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WebhookEvent {
    pub fn named(event: &str) -> Self {
        Self {
            event: event.to_string(),
            timestamp: Utc::now(),
            dir: None,
            stats: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_dir(mut self, dir: String) -> Self {
        self.dir = Some(dir);
        self
    }

    pub fn with_stats(mut self, stats: WebhookStats) -> Self {
        self.stats = Some(stats);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Auth {
    None,
    Bearer(String),
    HmacSha256(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid webhook auth spec: {0:?} (want \"\", \"bearer:<token>\", or \"hmac-sha256:<secret>\")")]
    InvalidAuthSpec(String),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// POSTs events to a set of URLs. An empty URL list builds a dispatcher
/// that is inert but safe for every operation.
pub struct WebhookDispatcher {
    urls: Vec<String>,
    event_filter: HashSet<String>,
    auth: Auth,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    /// Build a dispatcher. `event_filter` empty means deliver everything;
    /// otherwise only events whose name is in the filter are delivered.
    pub fn new(
        urls: Vec<String>,
        event_filter: Vec<String>,
        auth_spec: &str,
    ) -> Result<Self, WebhookError> {
        let auth = parse_auth(auth_spec)?;
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self {
            urls,
            event_filter: event_filter.into_iter().collect(),
            auth,
            client,
        })
    }

    /// Whether this dispatcher has anywhere to deliver to.
    pub fn is_inert(&self) -> bool {
        self.urls.is_empty()
    }

    /// Serialize `event` once and start one delivery task per URL.
    /// Returns immediately; delivery errors are dropped.
    pub fn fire(&self, event: &WebhookEvent) {
        if self.urls.is_empty() {
            return;
        }
        if !self.event_filter.is_empty() && !self.event_filter.contains(&event.event) {
            return;
        }
        let body = match serde_json::to_vec(event) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize webhook event");
                return;
            }
        };
        for url in &self.urls {
            let request = self
                .client
                .post(url.as_str())
                .header("Content-Type", "application/json");
            let request = match &self.auth {
                Auth::None => request,
                Auth::Bearer(token) => request.header("Authorization", format!("Bearer {token}")),
                Auth::HmacSha256(secret) => {
                    request.header(SIGNATURE_HEADER, sign_body(secret, &body))
                }
            };
            let request = request.body(body.clone());
            let url = url.clone();
            let event_name = event.event.clone();
            tokio::spawn(async move {
                match request.send().await {
                    Ok(resp) => {
                        tracing::debug!(url = %url, event = %event_name, status = %resp.status(), "Webhook delivered");
                    }
                    Err(e) => {
                        tracing::debug!(url = %url, event = %event_name, error = %e, "Webhook delivery failed");
                    }
                }
            });
        }
    }
}

fn parse_auth(spec: &str) -> Result<Auth, WebhookError> {
    if spec.is_empty() {
        return Ok(Auth::None);
    }
    if let Some(token) = spec.strip_prefix("bearer:") {
        return Ok(Auth::Bearer(token.to_string()));
    }
    if let Some(secret) = spec.strip_prefix("hmac-sha256:") {
        return Ok(Auth::HmacSha256(secret.to_string()));
    }
    Err(WebhookError::InvalidAuthSpec(spec.to_string()))
}

/// `sha256=<hex>` HMAC over the exact JSON body.
fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
