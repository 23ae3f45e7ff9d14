/// Webhook trigger endpoint
///
/// `ANY /webhook/{token}` turns the HTTP request into a `WebhookRequest` and
/// maps the dispatcher's verdict onto status codes:
/// 202 accepted, 404 unknown token, 403 disabled or IP denied, 401 secret
/// mismatch, 429 rate limited (with `Retry-After`), 503 admission store down,
/// 422 invalid workflow.

use crate::api::AppState;
use crate::trigger::{WebhookRejection, WebhookRequest};
use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{any, Router},
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

/// Larger bodies are refused before parsing
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/{token}", any(execute_webhook))
}

async fn execute_webhook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    tracing::info!("📥 Webhook request received: {} {}", parts.method, parts.uri.path());

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("❌ Webhook body could not be read: {}", e);
            return error(StatusCode::PAYLOAD_TOO_LARGE, "body_too_large", "request body too large");
        }
    };
    let body: Value = if bytes.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("❌ Invalid JSON payload for webhook - Error: {}", e);
                return error(StatusCode::BAD_REQUEST, "invalid_json", "request body is not valid JSON");
            }
        }
    };

    let query = Query::<BTreeMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(q)| q)
        .unwrap_or_default();
    let peer = parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip());
    let source_ip = source_ip(&parts.headers, peer, state.webhook_config.trust_forwarded_for);

    let webhook_request = WebhookRequest {
        token,
        method: parts.method.to_string(),
        headers: header_map(&parts.headers),
        query,
        body,
        source_ip,
    };

    match state.webhooks.dispatch(webhook_request).await {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(rejection) => rejection_response(&rejection),
    }
}

fn rejection_response(rejection: &WebhookRejection) -> Response {
    let status = match rejection {
        WebhookRejection::InvalidToken => StatusCode::NOT_FOUND,
        WebhookRejection::Disabled | WebhookRejection::IpDenied => StatusCode::FORBIDDEN,
        WebhookRejection::SecretMismatch => StatusCode::UNAUTHORIZED,
        WebhookRejection::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        WebhookRejection::AdmissionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        WebhookRejection::InvalidWorkflow(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WebhookRejection::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = error(status, rejection.reason(), &rejection.to_string());
    if let Some(secs) = rejection.retry_after_secs() {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn error(status: StatusCode, reason: &str, message: &str) -> Response {
    (status, Json(json!({ "error": reason, "message": message }))).into_response()
}

/// Header names are already lower-case in `HeaderMap`; non-UTF-8 values are dropped
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

fn source_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    peer
}
