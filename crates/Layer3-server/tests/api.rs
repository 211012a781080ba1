//! HTTP surface tests against in-memory collaborators
//!
//! `cargo test -p devyard-server --test api`

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use devyard_foundation::{
    DevyardConfig, Error, Result, SnapshotWriter, AGENTS_FILE, SESSIONS_FILE,
};
use devyard_runtime::{
    CommandOutput, ContainerRunner, ProjectTarget, ShellConnector, ShellHandle, StaticProjects,
    TermSize,
};
use devyard_server::{router, AppState, Collaborators};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tower::ServiceExt;

/// Compose runner whose build takes a moment
struct SlowRunner;

#[async_trait]
impl ContainerRunner for SlowRunner {
    async fn build(&self, _: &ProjectTarget) -> Result<CommandOutput> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(CommandOutput {
            exit_code: 0,
            stdout: "Step 1/1 : FROM alpine\n".to_string(),
            stderr: String::new(),
        })
    }
    async fn up(&self, _: &ProjectTarget) -> Result<CommandOutput> {
        Ok(CommandOutput::default())
    }
    async fn down(&self, _: &ProjectTarget) -> Result<CommandOutput> {
        Ok(CommandOutput::default())
    }
    async fn ps(&self, _: &ProjectTarget) -> Result<CommandOutput> {
        Ok(CommandOutput::default())
    }
    async fn logs(&self, _: &ProjectTarget, _: usize) -> Result<CommandOutput> {
        Ok(CommandOutput::default())
    }
    async fn exec(&self, _: &ProjectTarget, _: &str) -> Result<CommandOutput> {
        Ok(CommandOutput::default())
    }
    fn spawn_exec(&self, _: &ProjectTarget, _: &str) -> Result<Child> {
        Err(Error::process("no container"))
    }
}

struct OfflineConnector;

#[async_trait]
impl ShellConnector for OfflineConnector {
    async fn connect(&self, _: &ProjectTarget, _: TermSize) -> Result<ShellHandle> {
        Err(Error::Connection("offline".to_string()))
    }
}

fn app() -> Router {
    let mut config = DevyardConfig::default();
    config.stream.poll_interval_ms = 20;

    let state = AppState::new(
        &config,
        Collaborators {
            containers: Arc::new(SlowRunner),
            connector: Arc::new(OfflineConnector),
            projects: Arc::new(StaticProjects::new().with(ProjectTarget::new("web", "web-dev"))),
            session_snapshots: SnapshotWriter::disabled(SESSIONS_FILE),
            agent_snapshots: SnapshotWriter::disabled(AGENTS_FILE),
        },
    );
    router(state)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_deploy_single_flight_and_status() {
    let app = app();

    let (status, body) = call(&app, "POST", "/api/projects/web/deploy", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "started": true }));

    let (_, body) = call(&app, "POST", "/api/projects/web/deploy", None).await;
    assert_eq!(body, json!({ "started": false }));

    let mut phase = Value::Null;
    for _ in 0..100 {
        let (_, body) = call(&app, "GET", "/api/projects/web/status", None).await;
        phase = body["phase"].clone();
        if phase == "running" {
            assert_eq!(body["active"], false);
            assert!(body["cursor"].as_u64().unwrap() > 0);
            let kinds: Vec<_> = body["log"]
                .as_array()
                .unwrap()
                .iter()
                .map(|e| e["kind"].as_str().unwrap().to_string())
                .collect();
            assert!(kinds.contains(&"line".to_string()));
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(phase, "running");
}

#[tokio::test]
async fn test_cancel_interrupts_deploy() {
    let app = app();

    let (_, body) = call(&app, "POST", "/api/projects/web/cancel", None).await;
    assert_eq!(body, json!({ "cancelled": false }));

    call(&app, "POST", "/api/projects/web/deploy", None).await;
    let (status, body) = call(&app, "POST", "/api/projects/web/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "cancelled": true }));

    let (_, body) = call(&app, "GET", "/api/projects/web/status", None).await;
    assert_eq!(body["phase"], "error");
    assert_eq!(body["active"], false);

    let (status, body) = call(&app, "GET", "/api/operations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["key"], "web");

    let (status, _) = call(&app, "POST", "/api/projects/nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_project_is_404() {
    let app = app();
    let (status, body) = call(&app, "POST", "/api/projects/nope/deploy", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = call(&app, "GET", "/api/projects/nope/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agent_errors() {
    let app = app();

    let (status, _) = call(
        &app,
        "POST",
        "/api/projects/web/agents",
        Some(json!({ "provider": "aider" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        "POST",
        "/api/projects/web/agents",
        Some(json!({ "provider": "codex" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _) = call(&app, "GET", "/api/agents/agent-missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, "POST", "/api/agents/agent-missing/stop", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, "GET", "/api/projects/web/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_sessions_listing() {
    let app = app();
    let (status, body) = call(&app, "GET", "/api/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = call(&app, "DELETE", "/api/sessions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_starts_with_snapshot() {
    let app = app();

    let request = Request::builder()
        .uri("/api/projects/web/stream")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut body = response.into_body().into_data_stream();
    let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("no frame")
        .expect("stream ended")
        .unwrap();
    let text = String::from_utf8_lossy(&chunk);
    assert!(text.contains("event: snapshot"));
    assert!(text.contains("\"cursor\":0"));
}
