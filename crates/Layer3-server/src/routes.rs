//! HTTP routes: deployments, log streams, agents, terminal sessions

use crate::error::ApiResult;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use devyard_foundation::Error;
use devyard_runtime::{
    AgentRecord, ClientFrame, ControlAction, DeploymentStatus, OperationStatus, ServerFrame,
    SessionMode, SessionMultiplexer, SessionRecord, StartAgentRequest, TermSize, ViewerConnection,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Default number of lines returned by the agent log endpoint
const DEFAULT_LOG_LINES: usize = 200;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Deployments
        .route("/api/projects/{key}/deploy", post(deploy))
        .route("/api/projects/{key}/teardown", post(teardown))
        .route("/api/projects/{key}/cancel", post(cancel))
        .route("/api/projects/{key}/status", get(status))
        .route("/api/projects/{key}/stream", get(stream))
        .route("/api/operations", get(operations))
        // Agents
        .route(
            "/api/projects/{key}/agents",
            get(list_agents).post(start_agent),
        )
        .route("/api/agents/{id}", get(get_agent))
        .route("/api/agents/{id}/stop", post(stop_agent))
        .route("/api/agents/{id}/logs", get(agent_logs))
        // Sessions
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", delete(close_session))
        .route("/ws/terminal", get(terminal))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// Deployments
// ============================================================================

async fn deploy(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<Json<Value>> {
    let outcome = state.deployer.deploy(&key)?;
    Ok(Json(json!({ "started": outcome.started() })))
}

async fn teardown(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = state.deployer.teardown(&key)?;
    Ok(Json(json!({ "started": outcome.started() })))
}

async fn cancel(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<Json<Value>> {
    let cancelled = state.deployer.cancel(&key).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn operations(State(state): State<AppState>) -> Json<Vec<OperationStatus>> {
    Json(state.deployer.operations())
}

async fn status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<DeploymentStatus>> {
    Ok(Json(state.deployer.status(&key)?))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    cursor: Option<u64>,
}

async fn stream(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    state.deployer.target(&key)?;
    debug!(key = %key, cursor = ?query.cursor, "Opening log stream");

    let frames = state
        .log
        .stream(key, query.cursor, state.poll_interval)
        .map(|frame| {
            Event::default()
                .event(frame.event_name())
                .id(frame.id().to_string())
                .json_data(&frame)
        });

    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Agents
// ============================================================================

async fn list_agents(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Vec<AgentRecord>>> {
    state.deployer.target(&key)?;
    Ok(Json(state.agents.list(Some(&key))))
}

async fn start_agent(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<StartAgentRequest>,
) -> ApiResult<Json<AgentRecord>> {
    Ok(Json(state.agents.start(&key, request)?))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentRecord>> {
    Ok(Json(state.agents.get(&id)?))
}

async fn stop_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentRecord>> {
    Ok(Json(state.agents.stop(&id)?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn agent_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Value>> {
    let lines = state
        .agents
        .logs(&id, query.lines.unwrap_or(DEFAULT_LOG_LINES))?;
    Ok(Json(json!({ "agentId": id, "lines": lines })))
}

// ============================================================================
// Sessions
// ============================================================================

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionRecord>> {
    Json(state.sessions.list())
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.sessions.close(&id)?;
    Ok(Json(json!({ "closed": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TerminalQuery {
    session_id: String,
    resource_key: String,
    mode: SessionMode,
    action: Option<ControlAction>,
    cols: Option<u16>,
    rows: Option<u16>,
}

impl TerminalQuery {
    fn size(&self) -> Option<TermSize> {
        match (self.cols, self.rows) {
            (Some(cols), Some(rows)) => Some(TermSize::new(cols, rows)),
            _ => None,
        }
    }
}

async fn terminal(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_terminal(socket, state.sessions, query))
        .into_response()
}

async fn handle_terminal(mut socket: WebSocket, sessions: SessionMultiplexer, query: TerminalQuery) {
    if query.action == Some(ControlAction::Close) {
        let frame = match sessions.close(&query.session_id) {
            Ok(()) => ServerFrame::info(format!("Session {} closed", query.session_id)),
            Err(e) => ServerFrame::error(e.to_string()),
        };
        let _ = send_frame(&mut socket, &frame).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let viewer = match sessions.attach(
        &query.session_id,
        &query.resource_key,
        query.mode,
        query.size(),
    ) {
        Ok(viewer) => viewer,
        Err(e) => {
            let _ = send_frame(&mut socket, &ServerFrame::error(e.to_string())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let viewer_id = viewer.id;
    let session_id = viewer.session_id.clone();
    bridge(&mut socket, &sessions, viewer).await;

    // The session may already be gone (closed or shell exited)
    let _ = sessions.detach(&session_id, viewer_id);
    debug!(session_id = %session_id, viewer = viewer_id, "Terminal socket finished");
}

/// Pump frames both ways until either side finishes
async fn bridge(socket: &mut WebSocket, sessions: &SessionMultiplexer, mut viewer: ViewerConnection) {
    loop {
        tokio::select! {
            frame = viewer.frames.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    // Session closed underneath us
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            message = socket.recv() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    _ => break,
                };
                let frame = match message {
                    Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            let reply = ServerFrame::error(format!("Invalid frame: {}", e));
                            if send_frame(socket, &reply).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    },
                    Message::Binary(bytes) => ClientFrame::Input {
                        data: String::from_utf8_lossy(&bytes).into_owned(),
                    },
                    Message::Close(_) => break,
                    _ => continue,
                };

                if let Some(reply) = apply(sessions, &viewer.session_id, frame) {
                    let closing = matches!(reply, Reply::Closed);
                    if let Reply::Error(err) = reply {
                        if send_frame(socket, &ServerFrame::error(err.to_string())).await.is_err() {
                            break;
                        }
                    }
                    if closing {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
}

enum Reply {
    Error(Error),
    Closed,
}

fn apply(sessions: &SessionMultiplexer, session_id: &str, frame: ClientFrame) -> Option<Reply> {
    let result = match frame {
        ClientFrame::Input { data } => sessions.input(session_id, data.as_bytes()),
        ClientFrame::Resize { cols, rows } => sessions.resize(session_id, TermSize::new(cols, rows)),
        ClientFrame::Control {
            action: ControlAction::Close,
        } => {
            return match sessions.close(session_id) {
                Ok(()) => Some(Reply::Closed),
                Err(e) => Some(Reply::Error(e)),
            };
        }
    };

    match result {
        Ok(()) => None,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Terminal frame rejected");
            Some(Reply::Error(e))
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}
