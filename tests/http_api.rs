//! HTTP surface driven through `tower::ServiceExt::oneshot`

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use flowgate::config::Config;
use flowgate::runtime::external::{ExternalClient, ExternalError, ExternalRequest, ExternalResponse};
use flowgate::server::{build_state, router, Collaborators};
use flowgate::store::Database;
use flowgate::trigger::AllowAll;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Offline;

#[async_trait]
impl ExternalClient for Offline {
    async fn send(&self, _request: ExternalRequest) -> Result<ExternalResponse, ExternalError> {
        Err(ExternalError::Permanent("offline".into()))
    }
}

async fn app() -> (Router, Database) {
    let db = Database::in_memory().await.unwrap();
    let collaborators = Collaborators {
        external: Arc::new(Offline),
        authorizer: Arc::new(AllowAll),
    };
    let state = build_state(&Config::default(), &db, collaborators).await.unwrap();
    (router(state), db)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value, Option<String>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json, retry_after)
}

async fn wait_terminal(app: &Router, execution_id: &str) -> Value {
    for _ in 0..200 {
        let (status, run, _) = send(app, "GET", &format!("/api/executions/{}", execution_id), None).await;
        assert_eq!(status, StatusCode::OK);
        if !matches!(run["status"].as_str(), Some("pending") | Some("running")) {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} did not finish", execution_id);
}

fn graded(token: &str, per_minute: u64) -> Value {
    json!({
        "workflow": {
            "id": "wf-grade",
            "name": "Grade",
            "nodes": [
                { "id": "hook", "node_type": "Webhook", "config": { "token": token, "rate_limit": { "per_minute": per_minute } } },
                { "id": "score", "node_type": "Transform", "config": { "code": "return { result = input.x > 5 }" } },
                { "id": "check", "node_type": "Condition", "config": { "expression": "$json.result" } }
            ],
            "edges": [
                { "from": "hook", "to": "score" },
                { "from": "score", "to": "check" }
            ]
        }
    })
}

#[tokio::test]
async fn health_check_responds() {
    let (app, _db) = app().await;
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn webhook_run_is_observable_through_status_endpoint() {
    let (app, _db) = app().await;
    let (status, created, _) = send(&app, "POST", "/api/workflows", Some(graded("tok-grade", 10))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["version"], 1);

    let (status, accepted, _) = send(&app, "POST", "/webhook/tok-grade", Some(json!({ "x": 10 }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "pending");
    let execution_id = accepted["execution_id"].as_str().unwrap().to_string();
    assert_eq!(accepted["status_url"], format!("/api/executions/{}", execution_id));

    let run = wait_terminal(&app, &execution_id).await;
    assert_eq!(run["status"], "completed");
    assert_eq!(run["trigger"], "webhook");
    assert_eq!(run["node_results"]["check"]["selected_handle"], "true");
    assert!(run["duration_ms"].is_number());

    let (status, runs, _) = send(&app, "GET", "/api/workflows/wf-grade/executions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn scenario_c_sixth_webhook_call_is_rate_limited() {
    let (app, _db) = app().await;
    send(&app, "POST", "/api/workflows", Some(graded("tok-burst", 5))).await;

    for _ in 0..5 {
        let (status, _, _) = send(&app, "POST", "/webhook/tok-burst", Some(json!({ "x": 1 }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, body, retry_after) = send(&app, "POST", "/webhook/tok-burst", Some(json!({ "x": 1 }))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limited");
    let retry_after: u64 = retry_after.unwrap().parse().unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
}

#[tokio::test]
async fn webhook_rejections_map_to_status_codes() {
    let (app, _db) = app().await;
    let (status, _, _) = send(&app, "POST", "/webhook/missing", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut wf = graded("tok-secret", 10);
    wf["workflow"]["nodes"][0]["config"]["secret"] = json!("hunter2");
    send(&app, "POST", "/api/workflows", Some(wf)).await;

    let (status, body, _) = send(&app, "POST", "/webhook/tok-secret", Some(json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "secret_mismatch");

    let request = Request::builder()
        .method("POST")
        .uri("/webhook/tok-secret")
        .header("x-flowgate-secret", "hunter2")
        .body(Body::from("{\"x\": 3}"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let (status, _, _) = send(&app, "POST", "/webhook/tok-secret", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_and_conflicting_definitions_are_refused() {
    let (app, _db) = app().await;

    let mut cyclic = graded("tok-a", 10);
    cyclic["workflow"]["edges"].as_array_mut().unwrap().push(json!({ "from": "check", "to": "score" }));
    let (status, body, _) = send(&app, "POST", "/api/workflows", Some(cyclic)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation");

    send(&app, "POST", "/api/workflows", Some(graded("tok-a", 10))).await;
    let (status, _, _) = send(&app, "POST", "/api/workflows", Some(graded("tok-a", 10))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let mut thief = graded("tok-a", 10);
    thief["workflow"]["id"] = json!("wf-thief");
    let (status, body, _) = send(&app, "POST", "/api/workflows", Some(thief)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].as_str().unwrap().contains("wf-grade"));
}

#[tokio::test]
async fn update_bumps_version_and_manual_run_uses_it() {
    let (app, _db) = app().await;
    send(&app, "POST", "/api/workflows", Some(graded("tok-v", 10))).await;

    let (status, updated, _) = send(&app, "PUT", "/api/workflows/wf-grade", Some(graded("tok-v", 20))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["version"], 2);

    let (status, accepted, _) = send(&app, "POST", "/api/workflows/wf-grade/run", Some(json!({ "x": 2 }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run = wait_terminal(&app, accepted["execution_id"].as_str().unwrap()).await;
    assert_eq!(run["workflow_version"], 2);
    assert_eq!(run["trigger"], "manual");
    assert_eq!(run["node_results"]["check"]["selected_handle"], "false");

    let (status, _, _) = send(&app, "DELETE", "/api/workflows/wf-grade", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, "POST", "/api/workflows/wf-grade/run", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sandbox_analysis_and_audit_endpoints() {
    let (app, _db) = app().await;

    let (status, report, _) = send(&app, "POST", "/api/sandbox/analyze", Some(json!({ "code": "os.execute('rm -rf /')" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["blocked"], true);
    assert!(!report["violations"].as_array().unwrap().is_empty());

    let (_, clean, _) = send(&app, "POST", "/api/sandbox/analyze", Some(json!({ "code": "return input.x * 2" }))).await;
    assert_eq!(clean["blocked"], false);

    send(&app, "POST", "/api/workflows", Some(graded("tok-audit", 10))).await;
    let (_, accepted, _) = send(&app, "POST", "/api/workflows/wf-grade/run", Some(json!({ "x": 9 }))).await;
    wait_terminal(&app, accepted["execution_id"].as_str().unwrap()).await;

    let (status, entries, _) = send(&app, "GET", "/api/sandbox/audit?limit=5&workflow_id=wf-grade", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["node_id"], "score");
    assert_eq!(entries[0]["outcome"], "success");
}

#[tokio::test]
async fn cancel_of_finished_or_unknown_run() {
    let (app, _db) = app().await;
    let (status, _, _) = send(&app, "POST", "/api/executions/nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(&app, "POST", "/api/workflows", Some(graded("tok-c", 10))).await;
    let (_, accepted, _) = send(&app, "POST", "/api/workflows/wf-grade/run", Some(json!({ "x": 1 }))).await;
    let execution_id = accepted["execution_id"].as_str().unwrap().to_string();
    wait_terminal(&app, &execution_id).await;

    let (status, _, _) = send(&app, "POST", &format!("/api/executions/{}/cancel", execution_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn event_stream_closes_after_the_run_finishes() {
    let (app, _db) = app().await;
    let mut wf = graded("tok-sse", 10);
    wf["workflow"]["nodes"][1]["config"] = json!({
        "code": "local n = 0 for i = 1, 3000000 do n = n + 1 end return { result = n > 5 }",
        "timeout_ms": 10000
    });
    send(&app, "POST", "/api/workflows", Some(wf)).await;
    let (_, accepted, _) = send(&app, "POST", "/api/workflows/wf-grade/run", Some(json!({}))).await;
    let execution_id = accepted["execution_id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri(format!("/api/executions/{}/events", execution_id))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // No further events are published once the run is over, so the body must end on its own
    let body = tokio::time::timeout(Duration::from_secs(10), response.into_body().collect())
        .await
        .expect("event stream stayed open after the run finished")
        .unwrap()
        .to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();

    let names: Vec<&str> = text.lines().filter_map(|line| line.strip_prefix("event: ")).collect();
    assert_eq!(names.first(), Some(&"snapshot"));
    let first_data = text.lines().find_map(|line| line.strip_prefix("data: ")).unwrap();
    let snapshot: Value = serde_json::from_str(first_data).unwrap();
    if matches!(snapshot["status"].as_str(), Some("pending") | Some("running")) {
        assert_eq!(names.last(), Some(&"run_finished"));
    }
    assert_eq!(wait_terminal(&app, &execution_id).await["status"], "completed");
}

#[tokio::test]
async fn manual_runs_past_the_limit_get_429() {
    let (app, _db) = app().await;
    let mut wf = graded("tok-manual", 10);
    wf["workflow"]["nodes"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "id": "go", "node_type": "ManualTrigger", "config": { "rate_limit": { "per_minute": 3 } } }));
    wf["workflow"]["edges"].as_array_mut().unwrap().push(json!({ "from": "go", "to": "score" }));
    let (status, _, _) = send(&app, "POST", "/api/workflows", Some(wf)).await;
    assert_eq!(status, StatusCode::CREATED);

    for x in 0..3 {
        let (status, _, _) = send(&app, "POST", "/api/workflows/wf-grade/run", Some(json!({ "x": x }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, body, retry_after) = send(&app, "POST", "/api/workflows/wf-grade/run", Some(json!({ "x": 4 }))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limited");
    let retry_after: u64 = retry_after.unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));

    // The webhook has its own budget
    let (status, _, _) = send(&app, "POST", "/webhook/tok-manual", Some(json!({ "x": 1 }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
