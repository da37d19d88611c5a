//! Agent and UI-observer websocket endpoints.
//!
//! `/ws/agent` speaks a small JSON framing protocol: the first frame an
//! agent sends must be `register`; everything after that is
//! `heartbeat`/`task_output`/`command_result`/`task_complete`/`pong`
//! going out, and `execute_task`/`ping` coming back (the latter two are
//! pushed from elsewhere through `AgentRegistry::send_to_agent`, not from
//! this module). `/ws/client` is read-only: it replays every task
//! transition broadcast on `AppState::task_events`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use waypoint_registry::{AgentRegistration, AgentSession};

use crate::middleware::constant_time_eq;
use crate::AppState;

pub async fn upgrade_agent(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

pub async fn upgrade_client(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state))
}

struct WsAgentSession {
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

#[async_trait]
impl AgentSession for WsAgentSession {
    async fn send(&self, message: serde_json::Value) -> Result<(), String> {
        self.tx.send(message).map_err(|_| "agent socket closed".to_string())
    }
}

#[derive(Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct TaskCompletePayload {
    task_id: String,
    success: bool,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();

    let writer = tokio::spawn(async move {
        while let Some(value) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&value) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut agent_id: Option<String> = None;

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };

        let frame: IncomingFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "malformed agent frame");
                continue;
            }
        };

        match frame.kind.as_str() {
            "register" if agent_id.is_none() => {
                let registration: AgentRegistration = match serde_json::from_value(frame.payload) {
                    Ok(r) => r,
                    Err(err) => {
                        tracing::warn!(error = %err, "malformed register frame");
                        break;
                    }
                };

                if let Some(expected) = &state.config.agent_shared_secret {
                    let presented = registration.secret.as_deref().unwrap_or("");
                    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                        tracing::warn!(agent_id = %registration.id, "agent register rejected: bad secret");
                        let _ = tx.send(serde_json::json!({
                            "type": "error",
                            "message": "invalid agent secret",
                        }));
                        break;
                    }
                }

                let id = registration.id.clone();
                state.registry.register(registration, Arc::new(WsAgentSession { tx: tx.clone() })).await;
                let _ = tx.send(serde_json::json!({
                    "type": "registered",
                    "agent_id": id,
                    "message": "welcome",
                }));
                agent_id = Some(id);
            }
            "register" => {
                tracing::warn!("duplicate register frame on an already-registered agent socket");
            }
            "heartbeat" => {
                if let Ok(heartbeat) = crate::handlers::parse_heartbeat(frame.payload) {
                    state.registry.heartbeat(heartbeat).await;
                }
            }
            "task_output" | "command_result" => {
                let _ = state.task_events.send(serde_json::json!({
                    "type": frame.kind,
                    "agent_id": agent_id,
                    "payload": frame.payload,
                }));
            }
            "task_complete" => {
                let Ok(body) = serde_json::from_value::<TaskCompletePayload>(frame.payload) else {
                    tracing::warn!("malformed task_complete frame");
                    continue;
                };
                match state
                    .scheduler
                    .complete_task(&body.task_id, body.success, body.exit_code, body.output, body.error)
                    .await
                {
                    Ok(task) => {
                        let _ = state.task_events.send(serde_json::json!({"type": "task", "task": task}));
                    }
                    Err(err) => tracing::warn!(error = %err, "task_complete referenced an unknown task"),
                }
            }
            "pong" => {}
            other => tracing::warn!(frame_type = other, "unrecognized agent frame type"),
        }
    }

    if let Some(id) = agent_id {
        state.registry.unregister(&id).await;
    }
    writer.abort();
}

async fn handle_client_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, _stream) = socket.split();
    let mut events = state.task_events.subscribe();

    loop {
        match events.recv().await {
            Ok(value) => {
                let Ok(text) = serde_json::to_string(&value) else { continue };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "client websocket fell behind the task event stream");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
