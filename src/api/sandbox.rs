/// Sandbox endpoints
///
/// `POST /api/sandbox/analyze` runs the static analyzer without executing
/// anything; `GET /api/sandbox/audit` reads back the append-only audit log.

use crate::api::{ApiResult, AppState};
use crate::sandbox::{AuditEntry, Violation};
use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub violations: Vec<Violation>,
    /// True when any violation is critical and the code would be refused
    pub blocked: bool,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
    pub workflow_id: Option<String>,
}

pub fn create_sandbox_routes() -> Router<AppState> {
    Router::new()
        .route("/api/sandbox/analyze", post(analyze))
        .route("/api/sandbox/audit", get(audit))
}

async fn analyze(State(state): State<AppState>, Json(request): Json<AnalyzeRequest>) -> Json<AnalyzeResponse> {
    let violations = state.sandbox.analyze(&request.code);
    let blocked = violations.iter().any(Violation::is_critical);
    tracing::debug!("🔍 Analyzed {} bytes: {} violations (blocked: {})", request.code.len(), violations.len(), blocked);
    Json(AnalyzeResponse { violations, blocked })
}

async fn audit(State(state): State<AppState>, Query(query): Query<AuditQuery>) -> ApiResult<Json<Vec<AuditEntry>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let entries = match &query.workflow_id {
        Some(workflow_id) => state.audit.recent_for_workflow(workflow_id, limit).await?,
        None => state.audit.recent(limit).await?,
    };
    Ok(Json(entries))
}
