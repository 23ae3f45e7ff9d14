/// Run inspection endpoints
///
/// - `GET /api/executions/{id}`: current snapshot with `duration_ms`
/// - `POST /api/executions/{id}/cancel`
/// - `GET /api/executions/{id}/events`: SSE stream of the run's events, opened
///   with a `snapshot` event and closed after `run_finished`

use crate::api::{ApiError, ApiResult, AppState};
use crate::runtime::ExecutionEvent;
use crate::workflow::types::ExecutionRun;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::{future, stream, Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/events", get(stream_events))
}

async fn load(state: &AppState, id: &str) -> ApiResult<ExecutionRun> {
    state
        .engine
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("execution '{}' not found", id)))
}

/// Run record plus its wall-clock duration
fn snapshot(run: &ExecutionRun) -> Value {
    let mut value = serde_json::to_value(run).unwrap_or_else(|_| json!({ "id": run.id }));
    if let Value::Object(obj) = &mut value {
        obj.insert("duration_ms".to_string(), json!(run.duration_ms()));
    }
    value
}

/// GET /api/executions/{id}
async fn get_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let run = load(&state, &id).await?;
    Ok(Json(snapshot(&run)))
}

/// POST /api/executions/{id}/cancel
async fn cancel_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<(StatusCode, Json<Value>)> {
    if state.engine.cancel(&id) {
        return Ok((StatusCode::ACCEPTED, Json(json!({ "execution_id": id, "canceled": true }))));
    }
    let run = load(&state, &id).await?;
    Err(ApiError::conflict(format!("execution '{}' already finished ({:?})", run.id, run.status)))
}

/// GET /api/executions/{id}/events
async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // Subscribe before reading the snapshot so no transition falls in between
    let receiver = state.events.subscribe();
    let run = load(&state, &id).await?;
    tracing::debug!("📡 SSE subscriber attached to execution {}", id);

    let first = Event::default()
        .event("snapshot")
        .json_data(snapshot(&run))
        .unwrap_or_else(|_| Event::default().event("snapshot"));

    let updates = if run.status.is_terminal() {
        stream::empty::<Event>().boxed()
    } else {
        let relevant = BroadcastStream::new(receiver)
            // Lagged receivers skip what they missed
            .filter_map(move |message| {
                future::ready(match message {
                    Ok(event) if event.execution_id() == id => Some(event),
                    _ => None,
                })
            })
            .boxed();
        // End the stream as soon as the final event is yielded
        stream::unfold(Some(relevant), |source| async move {
            let mut source = source?;
            let event: ExecutionEvent = source.next().await?;
            let rest = if event.is_final() { None } else { Some(source) };
            Some((event, rest))
        })
        .map(|event| {
            Event::default()
                .event(event.name())
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().event(event.name()))
        })
        .boxed()
    };

    let events = stream::once(future::ready(first)).chain(updates).map(Ok);
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
