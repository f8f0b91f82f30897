use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
};

use crate::engine::{
    error::RunnerError,
    executor::PipelineExecutor,
    metrics::MetricsRegistry,
    models::{ClientFrame, InputRequest, KillRequest, RunRequest, SessionSummary, StatusResponse},
    registry::SessionRegistry,
    relay::ConnectionTable,
    workspace::validate_client_id,
};

#[derive(Clone)]
pub struct AppState {
    executor: Arc<PipelineExecutor>,
    connections: Arc<ConnectionTable>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<MetricsRegistry>,
}

impl AppState {
    pub fn new(
        executor: Arc<PipelineExecutor>,
        connections: Arc<ConnectionTable>,
        registry: Arc<SessionRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            executor,
            connections,
            registry,
            metrics,
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/api/languages", get(languages))
        .route("/api/run", post(run_code))
        .route("/api/input", post(send_input))
        .route("/api/kill", post(kill_process))
        .route("/api/sessions/{client_id}", get(get_session))
        .route("/ws/{client_id}", get(client_socket))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "active_sessions": state.registry.len(),
        "connections": state.connections.len(),
    }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn languages(State(state): State<AppState>) -> Json<Vec<&'static str>> {
    Json(state.executor.languages().languages())
}

async fn run_code(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, RunnerError> {
    let Json(request) = payload?;
    state.executor.run(request).await?;
    Ok(Json(StatusResponse::STARTED))
}

async fn send_input(
    State(state): State<AppState>,
    payload: Result<Json<InputRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, RunnerError> {
    let Json(request) = payload?;
    state
        .executor
        .send_input(&request.client_id, &request.input)
        .await?;
    Ok(Json(StatusResponse::INPUT_SENT))
}

async fn kill_process(
    State(state): State<AppState>,
    payload: Result<Json<KillRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, RunnerError> {
    let Json(request) = payload?;
    state.executor.kill(&request.client_id)?;
    Ok(Json(StatusResponse::PROCESS_KILLED))
}

async fn get_session(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<SessionSummary>, RunnerError> {
    state
        .executor
        .session(&client_id)
        .map(Json)
        .ok_or(RunnerError::SessionNotFound)
}

async fn client_socket(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, RunnerError> {
    validate_client_id(&client_id)?;
    Ok(ws.on_upgrade(move |socket| serve_socket(state, client_id, socket)))
}

async fn serve_socket(state: AppState, client_id: String, mut socket: WebSocket) {
    let (connection_id, mut events) = state.connections.bind(&client_id);
    tracing::info!(client_id = %client_id, %connection_id, "client connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(client_id = %client_id, error = %err, "failed to encode event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                if event.is_terminal() {
                    tracing::debug!(client_id = %client_id, "session output complete");
                }
            }
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&state, &client_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.connections.unbind(&client_id, connection_id);
    tracing::info!(client_id = %client_id, %connection_id, "client disconnected");
}

/// Structured frames are honored; anything else is treated as raw keystrokes.
async fn handle_client_frame(state: &AppState, client_id: &str, text: &str) {
    let result = match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Input { data }) => state.executor.stream_input(client_id, &data).await,
        Ok(ClientFrame::Kill) => state.executor.kill(client_id),
        Err(_) => state.executor.stream_input(client_id, text).await,
    };
    if let Err(err) = result {
        tracing::debug!(client_id, error = %err, "client frame ignored");
    }
}
