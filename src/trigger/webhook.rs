/// Webhook trigger validation and dispatch
///
/// Checks run in a fixed order and stop at the first failure:
/// 1. token resolves to a webhook node
/// 2. the node and its workflow are active
/// 3. shared secret header matches (when configured)
/// 4. source IP is on the allow-list (when configured)
/// 5. the admission guard admits `webhook:<token>`
///
/// Only then is a run created. The request body becomes the trigger input with
/// request metadata merged in under `_meta`.

use crate::error::EngineError;
use crate::ratelimit::{limits_from_node_config, Admission, RateLimiter};
use crate::runtime::ExecutionEngine;
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::types::{Node, RunRequest, RunStatus, TriggerSource};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Header carrying the webhook's shared secret
pub const SECRET_HEADER: &str = "x-flowgate-secret";

/// An inbound webhook call, already decoupled from the HTTP framework
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub token: String,
    pub method: String,
    /// Lower-cased header names
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Value,
    pub source_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookAccepted {
    pub execution_id: String,
    pub status: RunStatus,
    pub status_url: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WebhookRejection {
    #[error("unknown webhook token")]
    InvalidToken,

    #[error("webhook is disabled")]
    Disabled,

    #[error("webhook secret mismatch")]
    SecretMismatch,

    #[error("source address not allowed")]
    IpDenied,

    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("admission temporarily unavailable: {0}")]
    AdmissionUnavailable(String),

    #[error("workflow is invalid: {0}")]
    InvalidWorkflow(String),

    #[error("failed to start run: {0}")]
    Internal(String),
}

impl WebhookRejection {
    /// Stable machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            WebhookRejection::InvalidToken => "invalid_token",
            WebhookRejection::Disabled => "disabled",
            WebhookRejection::SecretMismatch => "secret_mismatch",
            WebhookRejection::IpDenied => "ip_denied",
            WebhookRejection::RateLimited { .. } => "rate_limited",
            WebhookRejection::AdmissionUnavailable(_) => "admission_unavailable",
            WebhookRejection::InvalidWorkflow(_) => "invalid_workflow",
            WebhookRejection::Internal(_) => "internal",
        }
    }

    /// Whole seconds for a `Retry-After` header, rounded up
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            WebhookRejection::RateLimited { retry_after_ms } => Some(retry_after_ms.div_ceil(1000).max(1)),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    registry: Arc<WorkflowRegistry>,
    engine: ExecutionEngine,
    limiter: Arc<RateLimiter>,
}

impl WebhookDispatcher {
    pub fn new(registry: Arc<WorkflowRegistry>, engine: ExecutionEngine, limiter: Arc<RateLimiter>) -> Self {
        Self {
            registry,
            engine,
            limiter,
        }
    }

    pub async fn dispatch(&self, request: WebhookRequest) -> Result<WebhookAccepted, WebhookRejection> {
        let (compiled, node_id) = self
            .registry
            .find_by_token(&request.token)
            .ok_or(WebhookRejection::InvalidToken)?;
        let workflow = compiled.workflow;
        let node = workflow
            .node(&node_id)
            .ok_or(WebhookRejection::InvalidToken)?;

        let node_active = node.config.get("active").and_then(Value::as_bool).unwrap_or(true);
        if !node_active || !workflow.is_active() {
            tracing::warn!("🚫 Webhook '{}' on workflow '{}' is not active", node_id, workflow.id);
            return Err(WebhookRejection::Disabled);
        }

        if let Some(expected) = node.config_str("secret") {
            let provided = request.headers.get(SECRET_HEADER).map(String::as_str).unwrap_or("");
            if !secrets_match(expected, provided) {
                tracing::warn!("🔑 Webhook '{}' secret mismatch", node_id);
                return Err(WebhookRejection::SecretMismatch);
            }
        }

        if !source_allowed(node, request.source_ip) {
            tracing::warn!("🚫 Webhook '{}' refused source {:?}", node_id, request.source_ip);
            return Err(WebhookRejection::IpDenied);
        }

        let key = format!("webhook:{}", request.token);
        let limits = limits_from_node_config(&node.config).unwrap_or_else(|| self.limiter.default_limits().to_vec());
        match self.limiter.check(&key, &limits).await {
            Ok(Admission::Allowed) => {}
            Ok(Admission::Denied { retry_after_ms, .. }) => {
                return Err(WebhookRejection::RateLimited { retry_after_ms });
            }
            Err(e) => {
                tracing::error!("❌ Admission check failed for webhook '{}': {}", node_id, e);
                return Err(WebhookRejection::AdmissionUnavailable(e.to_string()));
            }
        }

        let input = with_meta(request.body, metadata(&request.method, &request.headers, &request.query, request.source_ip));
        let run_request = RunRequest::from_trigger(TriggerSource::Webhook, node_id.clone(), input);

        let run = self.engine.run(Arc::clone(&workflow), run_request).await.map_err(|e| match e {
            EngineError::Validation(msg) => WebhookRejection::InvalidWorkflow(msg),
            other => WebhookRejection::Internal(other.to_string()),
        })?;

        tracing::info!("📥 Webhook '{}' accepted, execution {} for workflow '{}'", node_id, run.id, workflow.id);
        Ok(WebhookAccepted {
            status_url: format!("/api/executions/{}", run.id),
            execution_id: run.id,
            status: run.status,
        })
    }
}

fn metadata(
    method: &str,
    headers: &BTreeMap<String, String>,
    query: &BTreeMap<String, String>,
    source_ip: Option<IpAddr>,
) -> Value {
    let headers: Map<String, Value> = headers
        .iter()
        .filter(|(name, _)| name.as_str() != SECRET_HEADER)
        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
        .collect();
    json!({
        "method": method,
        "headers": headers,
        "query": query,
        "source_ip": source_ip.map(|ip| ip.to_string()),
        "received_at": Utc::now().to_rfc3339(),
    })
}

/// Object bodies get `_meta` added; anything else is wrapped as `body`
fn with_meta(body: Value, meta: Value) -> Value {
    match body {
        Value::Object(mut obj) => {
            obj.insert("_meta".to_string(), meta);
            Value::Object(obj)
        }
        other => json!({ "body": other, "_meta": meta }),
    }
}

/// Compares every byte of `expected` regardless of where the first mismatch is
fn secrets_match(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    let mut diff = expected.len() ^ provided.len();
    for (i, byte) in expected.iter().enumerate() {
        diff |= (byte ^ provided.get(i).copied().unwrap_or(0)) as usize;
    }
    diff == 0
}

/// An empty or absent `allowed_ips` list admits everyone
fn source_allowed(node: &Node, source_ip: Option<IpAddr>) -> bool {
    let rules: Vec<&str> = node
        .config
        .get("allowed_ips")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if rules.is_empty() {
        return true;
    }
    let Some(ip) = source_ip else {
        return false;
    };
    let ip = ip.to_canonical();
    rules.iter().any(|rule| ip_matches(ip, rule))
}

/// Exact address or CIDR range (`10.0.0.0/8`, `2001:db8::/32`)
pub fn ip_matches(ip: IpAddr, rule: &str) -> bool {
    let rule = rule.trim();
    let Some((network, bits)) = rule.split_once('/') else {
        return rule.parse::<IpAddr>().map(|addr| addr.to_canonical() == ip).unwrap_or(false);
    };
    let (Ok(network), Ok(bits)) = (network.parse::<IpAddr>(), bits.parse::<u32>()) else {
        return false;
    };
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            bits <= 32 && prefix_matches(u32::from(net) as u128, u32::from(addr) as u128, bits, 32)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            bits <= 128 && prefix_matches(u128::from(net), u128::from(addr), bits, 128)
        }
        _ => false,
    }
}

fn prefix_matches(network: u128, addr: u128, bits: u32, width: u32) -> bool {
    if bits == 0 {
        return true;
    }
    let shift = width - bits;
    (network >> shift) == (addr >> shift)
}
