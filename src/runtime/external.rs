/// External-call nodes: HTTPClient and Agent
///
/// Both build an `ExternalRequest` and hand it to an `ExternalClient`. Transient
/// failures (HTTP 429/5xx, connect errors, client timeouts) are retried here with
/// exponential backoff; the orchestrator never retries.
///
/// HTTPClient config: `{ "url", "method"?: "GET", "headers"?: {...}, "body"?: ..., "max_retries"?: 2, "backoff_ms"?: 200 }`
/// Agent config: `{ "endpoint", "prompt"?, "model"?, "headers"?: {...}, "max_retries"?, "backoff_ms"? }`

use crate::error::EngineError;
use crate::runtime::executor::{NodeContext, NodeExecutor, NodeOutcome};
use crate::workflow::types::{Node, NodeType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_RETRIES: u64 = 2;
const DEFAULT_BACKOFF_MS: u64 = 200;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, otherwise the raw text
    pub body: Value,
}

impl ExternalResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Rate limits and server errors may succeed on retry
    pub fn is_transient(&self) -> bool {
        self.status == 429 || self.status >= 500
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExternalError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

/// Transport for outbound calls
#[async_trait]
pub trait ExternalClient: Send + Sync {
    async fn send(&self, request: ExternalRequest) -> Result<ExternalResponse, ExternalError>;
}

/// `reqwest` implementation
#[derive(Debug, Clone, Default)]
pub struct HttpExternalClient {
    client: reqwest::Client,
}

impl HttpExternalClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExternalClient for HttpExternalClient {
    async fn send(&self, request: ExternalRequest) -> Result<ExternalResponse, ExternalError> {
        tracing::debug!("🌍 HTTP Request: {} {}", request.method, request.url);

        let mut request_builder = match request.method.to_uppercase().as_str() {
            "GET" => self.client.get(&request.url),
            "POST" => self.client.post(&request.url),
            "PUT" => self.client.put(&request.url),
            "DELETE" => self.client.delete(&request.url),
            "PATCH" => self.client.patch(&request.url),
            other => return Err(ExternalError::Permanent(format!("Unsupported HTTP method: {}", other))),
        };

        request_builder = request_builder.timeout(Duration::from_millis(request.timeout_ms));
        for (key, value) in &request.headers {
            request_builder = request_builder.header(key.as_str(), value.as_str());
        }

        match &request.body {
            Some(Value::String(text)) => {
                request_builder = request_builder
                    .header("Content-Type", "text/plain")
                    .body(text.clone());
            }
            Some(body) => {
                request_builder = request_builder.json(body);
            }
            None => {}
        }

        let response = request_builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                ExternalError::Transient(format!("HTTP request failed: {}", e))
            } else {
                ExternalError::Permanent(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| ExternalError::Transient(format!("Failed to read response body: {}", e)))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        tracing::debug!("📡 Response status: {}", status);
        Ok(ExternalResponse { status, headers, body })
    }
}

pub struct ExternalCallExecutor {
    client: Arc<dyn ExternalClient>,
}

impl ExternalCallExecutor {
    pub fn new(client: Arc<dyn ExternalClient>) -> Self {
        Self { client }
    }

    /// Send with bounded retries; only transient failures are retried
    async fn send_with_retry(&self, node: &Node, request: ExternalRequest) -> Result<ExternalResponse, EngineError> {
        let max_retries = node.config_u64("max_retries").unwrap_or(DEFAULT_MAX_RETRIES);
        let backoff_ms = node.config_u64("backoff_ms").unwrap_or(DEFAULT_BACKOFF_MS);
        let mut attempt = 0u64;

        loop {
            attempt += 1;
            let failure = match self.client.send(request.clone()).await {
                Ok(response) if response.is_transient() => format!("HTTP {} from {}", response.status, request.url),
                Ok(response) if !response.is_success() => {
                    return Err(EngineError::node(
                        &node.id,
                        format!("HTTP {} from {}", response.status, request.url),
                    ));
                }
                Ok(response) => return Ok(response),
                Err(ExternalError::Transient(msg)) => msg,
                Err(ExternalError::Permanent(msg)) => return Err(EngineError::node(&node.id, msg)),
            };

            if attempt > max_retries {
                return Err(EngineError::TransientIntegration(format!(
                    "node '{}' gave up after {} attempt(s): {}",
                    node.id, attempt, failure
                )));
            }

            let delay = retry_delay(backoff_ms, attempt);
            tracing::warn!("🔁 Node '{}' attempt {}/{} failed: {}. Retrying in {:?}",
                node.id, attempt, max_retries + 1, failure, delay);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`
fn retry_delay(base_ms: u64, attempt: u64) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
}

fn headers_from(node: &Node) -> BTreeMap<String, String> {
    node.config
        .get("headers")
        .and_then(|h| h.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn build_http_request(node: &Node, input: &Value) -> Result<ExternalRequest, EngineError> {
    let url = node
        .config_str("url")
        .ok_or_else(|| EngineError::node(&node.id, "HTTPClient missing 'url' parameter"))?;
    let method = node.config_str("method").unwrap_or("GET").to_uppercase();

    // Explicit body wins; otherwise the node input is sent for body-carrying methods
    let body = match node.config.get("body") {
        Some(body) => Some(body.clone()),
        None if matches!(method.as_str(), "POST" | "PUT" | "PATCH") && !input.is_null() => Some(input.clone()),
        None => None,
    };

    Ok(ExternalRequest {
        method,
        url: url.to_string(),
        headers: headers_from(node),
        body,
        timeout_ms: node.config_u64("request_timeout_ms").unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
    })
}

fn build_agent_request(node: &Node, input: &Value, ctx: &NodeContext) -> Result<ExternalRequest, EngineError> {
    let endpoint = node
        .config_str("endpoint")
        .ok_or_else(|| EngineError::node(&node.id, "Agent missing 'endpoint' parameter"))?;

    let body = json!({
        "prompt": node.config.get("prompt").cloned().unwrap_or(Value::Null),
        "model": node.config.get("model").cloned().unwrap_or(Value::Null),
        "input": input,
        "context": {
            "execution_id": ctx.execution_id,
            "workflow_id": ctx.workflow_id,
            "node_id": node.id,
        }
    });

    Ok(ExternalRequest {
        method: "POST".to_string(),
        url: endpoint.to_string(),
        headers: headers_from(node),
        body: Some(body),
        timeout_ms: node.config_u64("request_timeout_ms").unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
    })
}

#[async_trait]
impl NodeExecutor for ExternalCallExecutor {
    async fn execute(&self, node: &Node, input: Value, ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        match node.node_type {
            NodeType::Agent => {
                tracing::debug!("🤖 Executing Agent node: {}", node.id);
                let request = build_agent_request(node, &input, ctx)?;
                let response = self.send_with_retry(node, request).await?;
                Ok(NodeOutcome::output(response.body))
            }
            _ => {
                tracing::debug!("🌐 Executing HTTPClient node: {}", node.id);
                let request = build_http_request(node, &input)?;
                let method = request.method.clone();
                let url = request.url.clone();
                let response = self.send_with_retry(node, request).await?;

                tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, response.status);
                Ok(NodeOutcome::output(json!({
                    "status": response.status,
                    "headers": response.headers,
                    "data": response.body,
                    "success": response.is_success(),
                })))
            }
        }
    }
}
