//! HTTP transport: tool calls over POST, tool list over GET, live logs over
//! WebSocket.
//!
//! Routes:
//! - `POST /mcp`: a JSON-RPC 2.0 body, dispatched identically to stdio
//! - `GET /mcp/tools`: the tool list without a JSON-RPC envelope
//! - `GET /health`: `{"status":"ok"}`
//! - `GET /ws/logs`: stream of `{type:"system_log"|"audit_log", data:{…}}`
//!
//! The HTTP layer adds no authentication; that is deferred to the
//! deployment (reverse proxy, network policy).

use crate::dispatcher::handle_rpc;
use crate::tools::tool_definitions;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use madrox_core::{audit, logging};
use madrox_orchestrator::InstanceManager;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct AppState {
    manager: Arc<InstanceManager>,
}

/// Build the router; split out so tests can drive it without a socket.
pub fn router(manager: Arc<InstanceManager>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/mcp/tools", get(tools_handler))
        .route("/health", get(health_handler))
        .route("/ws/logs", get(ws_handler))
        .with_state(AppState { manager })
}

/// Serve the HTTP transport until the task is aborted.
pub async fn serve(manager: Arc<InstanceManager>, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("http transport listening on port {port}");
    axum::serve(listener, router(manager)).await
}

async fn mcp_handler(State(state): State<AppState>, Json(request): Json<Value>) -> Json<Value> {
    match handle_rpc(&state.manager, &request).await {
        Some(response) => Json(response),
        // A notification over HTTP still needs an HTTP response body.
        None => Json(json!({"jsonrpc": "2.0", "result": null})),
    }
}

async fn tools_handler() -> Json<Value> {
    Json(json!({"tools": tool_definitions()}))
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Upgrade to WebSocket and bridge both log broadcasters to the client.
async fn ws_handler(ws: WebSocketUpgrade, State(_state): State<AppState>) -> Response {
    ws.on_upgrade(stream_logs)
}

async fn stream_logs(mut socket: WebSocket) {
    info!("log stream subscriber connected");
    let mut system_rx = logging::subscribe_system();
    let mut audit_rx = audit::subscribe_audit();

    loop {
        tokio::select! {
            event = system_rx.recv() => {
                match event {
                    Ok(event) => {
                        let frame = json!({"type": "system_log", "data": event});
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("log subscriber lagged, skipped {n} system events");
                    }
                    Err(_) => break,
                }
            }
            event = audit_rx.recv() => {
                match event {
                    Ok(event) => {
                        let frame = json!({"type": "audit_log", "data": event});
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("log subscriber lagged, skipped {n} audit events");
                    }
                    Err(_) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // client messages are ignored
                    Some(Err(e)) => {
                        debug!("log stream recv error: {e}");
                        break;
                    }
                }
            }
        }
    }
    // The dropped receivers prune this subscriber from both broadcasters.
    warn!("log stream subscriber disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(frame.to_string())).await
}
