/// Workflow management REST API endpoints
///
/// Provides CRUD operations for workflow definitions with hot-reload support,
/// plus programmatic runs and per-workflow run history. Definitions are
/// validated before they are stored; every update bumps the version.

use crate::api::{ApiError, ApiResult, AppState};
use crate::trigger::auth::Principal;
use crate::workflow::{
    graph::validate_workflow,
    types::{ExecutionRun, NodeType, Workflow},
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Header naming the caller for manual runs; identity is resolved upstream
pub const USER_HEADER: &str = "x-flowgate-user";

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub version: u32,
    pub message: String,
}

/// Request body for workflow creation and update
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub workflow: Workflow,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow).put(update_workflow).delete(delete_workflow))
        .route("/api/workflows/{id}/run", post(run_workflow))
        .route("/api/workflows/{id}/executions", get(list_executions))
}

/// Reject definitions the engine could not run, and webhook tokens owned by
/// another workflow
fn check_definition(state: &AppState, workflow: &Workflow) -> ApiResult<()> {
    if workflow.id.is_empty() || workflow.name.is_empty() {
        return Err(ApiError::bad_request("workflow id and name are required"));
    }
    validate_workflow(workflow)?;

    for node in workflow.nodes.iter().filter(|n| n.node_type == NodeType::Webhook) {
        if let Some(token) = node.config_str("token") {
            if let Some(owner) = state.registry.token_owner(token) {
                if owner != workflow.id {
                    return Err(ApiError::conflict(format!(
                        "webhook token of node '{}' is already used by workflow '{}'",
                        node.id, owner
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Persist, hot-reload the registry and resync cron jobs
async fn publish(state: &AppState, workflow: &Workflow) -> ApiResult<()> {
    state.storage.save_workflow(workflow).await?;
    state.registry.reload_workflow(&workflow.id).await?;
    state.scheduler.sync_workflow(workflow).await?;
    Ok(())
}

/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "nodes": [...], "edges": [...] } }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowResponse>)> {
    let mut workflow = payload.workflow;
    workflow.version = 1;
    check_definition(&state, &workflow)?;

    if state.storage.get_workflow(&workflow.id).await?.is_some() {
        return Err(ApiError::conflict(format!("workflow '{}' already exists", workflow.id)));
    }

    publish(&state, &workflow).await?;
    tracing::info!("🔥 Created workflow: {} ({})", workflow.id, workflow.name);

    Ok((
        StatusCode::CREATED,
        Json(WorkflowResponse {
            id: workflow.id.clone(),
            version: workflow.version,
            message: format!("Workflow '{}' created successfully", workflow.name),
        }),
    ))
}

/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let workflows = state.storage.list_workflows().await?;
    Ok(Json(json!({ "workflows": workflows })))
}

/// GET /api/workflows/{id}
async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Workflow>> {
    state
        .storage
        .get_workflow(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("workflow '{}' not found", id)))
}

/// PUT /api/workflows/{id}
///
/// Stores the definition as the next version; runs already in flight keep the
/// version they started with.
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> ApiResult<Json<WorkflowResponse>> {
    let existing = state
        .storage
        .get_workflow(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workflow '{}' not found", id)))?;

    let mut workflow = payload.workflow;
    workflow.id = id;
    workflow.version = existing.version + 1;
    check_definition(&state, &workflow)?;

    publish(&state, &workflow).await?;
    tracing::info!("🔥 Hot-reloaded workflow: {} ({}) v{}", workflow.id, workflow.name, workflow.version);

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        version: workflow.version,
        message: format!("Workflow '{}' updated successfully", workflow.name),
    }))
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.scheduler.remove_workflow_cron_triggers(&id).await;
    state.registry.remove_workflow(&id);

    if !state.storage.delete_workflow(&id).await? {
        return Err(ApiError::not_found(format!("workflow '{}' not found", id)));
    }
    tracing::info!("🗑️ Deleted workflow: {}", id);
    Ok(Json(json!({ "message": "Workflow deleted successfully" })))
}

/// POST /api/workflows/{id}/run
/// Body: trigger input (any JSON, optional)
/// 429 with `Retry-After` once the workflow's manual admission is spent
async fn run_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let input = if body.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {}", e)))?
    };
    let principal = match headers.get(USER_HEADER).and_then(|v| v.to_str().ok()) {
        Some(user) => Principal::user(user),
        None => Principal::anonymous(),
    };

    let run = state.dispatcher.run_manual(&id, input, &principal).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "execution_id": run.id,
            "status": run.status,
            "status_url": format!("/api/executions/{}", run.id),
        })),
    ))
}

/// GET /api/workflows/{id}/executions?limit=20
async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ExecutionRun>>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    Ok(Json(state.engine.list(&id, limit).await?))
}
