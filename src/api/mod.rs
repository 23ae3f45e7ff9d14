/// HTTP API Layer
///
/// This module provides the REST API endpoints for workflow management,
/// triggers and run inspection. It handles:
/// - Workflow CRUD operations with validation and hot reload
/// - Webhook triggers and programmatic runs
/// - Run status, cancellation and live SSE progress
/// - Sandbox code analysis and the audit trail

// Workflow management endpoints (POST/GET/PUT/DELETE) and programmatic runs
pub mod workflows;

// Webhook trigger endpoint
pub mod webhooks;

// Run status, cancel and event stream
pub mod executions;

// Static analysis and audit log
pub mod sandbox;

use crate::config::WebhookConfig;
use crate::error::{EngineError, ErrorKind};
use crate::runtime::{BroadcastPublisher, ExecutionEngine};
use crate::sandbox::{AuditLog, Sandbox};
use crate::store::WorkflowStorage;
use crate::trigger::{CronSchedulerService, TriggerDispatcher, TriggerError, WebhookDispatcher};
use crate::workflow::registry::WorkflowRegistry;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Workflow storage for persistence
    pub storage: WorkflowStorage,
    /// Hot-reload registry for in-memory workflows
    pub registry: Arc<WorkflowRegistry>,
    /// Cron scheduler service for background job management
    pub scheduler: Arc<CronSchedulerService>,
    pub engine: ExecutionEngine,
    pub dispatcher: TriggerDispatcher,
    pub webhooks: WebhookDispatcher,
    /// Source of the SSE stream
    pub events: BroadcastPublisher,
    pub sandbox: Arc<dyn Sandbox>,
    pub audit: AuditLog,
    pub webhook_config: WebhookConfig,
}

/// JSON error response: `{ "error": kind, "message": ... }`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub message: String,
    /// Sent as `Retry-After` when set
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!("❌ Internal error: {}", err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "error": self.error, "message": self.message }))).into_response();
        if let Some(secs) = self.retry_after_secs {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err.kind() {
            ErrorKind::Validation => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation", err.to_string()),
            ErrorKind::Storage => Self::internal(err),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "engine", err.to_string()),
        }
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::NotFound(_) => Self::not_found(err.to_string()),
            TriggerError::Forbidden(_) => Self::new(StatusCode::FORBIDDEN, "forbidden", err.to_string()),
            TriggerError::Disabled(_) => Self::new(StatusCode::FORBIDDEN, "disabled", err.to_string()),
            TriggerError::RateLimited { .. } => Self {
                retry_after_secs: err.retry_after_secs(),
                ..Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", err.to_string())
            },
            TriggerError::AdmissionUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "admission_unavailable", "admission check unavailable")
            }
            TriggerError::Engine(e) => e.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// Re-export router builders
pub use executions::create_execution_routes;
pub use sandbox::create_sandbox_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::create_workflow_routes;
