use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Json},
    routing::{get, patch, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::errors::ServerError;
use crate::models::{
    CaptureQuery, ClientMessage, CreateSessionRequest, InputRequest, ResizeRequest, ServerEvent,
    SignalRequest, TerminalControl, UpdateSessionRequest,
};
use crate::session::{PtyOutput, PtySession};
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", patch(update_session).delete(delete_session))
        .route("/sessions/{id}/capture", get(capture_session))
        .route("/sessions/{id}/resize", post(resize_session))
        .route("/sessions/{id}/input", post(send_input))
        .route("/signal", post(send_signal))
        .route("/ws", get(websocket_events))
        .route("/sessions/{id}/ws", get(websocket_terminal))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.session_count()
    }))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "sessions": state.ordered_sessions()
    }))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ServerError> {
    debug!(
        "[http] POST /sessions - shell={}, cwd={:?}, client={:?}",
        request.shell, request.cwd, request.client_id
    );
    let info = state.create_session(request)?;
    Ok(Json(info))
}

async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateSessionRequest>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.update_session(&id, request)?))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state.delete_session(&id)?;
    Ok(Json(serde_json::json!({
        "status": "terminated",
        "id": id
    })))
}

async fn capture_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<CaptureQuery>,
) -> Result<impl IntoResponse, ServerError> {
    let session = state.get(&id)?;

    if params.processed {
        let lines = session.screen_lines(params.viewport);
        Ok(Json(serde_json::json!({
            "content": lines.join("\n"),
            "lines": lines.len(),
            "processed": true
        })))
    } else {
        // Raw scrollback, escape sequences included.
        let content = session.scrollback();
        Ok(Json(serde_json::json!({
            "content": content,
            "length": content.len(),
            "processed": false
        })))
    }
}

async fn resize_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.resize_session(&id, request.cols, request.rows)?))
}

async fn send_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<InputRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let session = state.get(&id)?;
    session.write_input(request.data.as_bytes())?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "bytes": request.data.len()
    })))
}

async fn send_signal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignalRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let report = state.signal(request.signum, request.session_id.as_deref())?;
    Ok(Json(report))
}

// =============================================================================
// WebSocket Handlers
// =============================================================================

async fn websocket_events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_event_websocket(socket, state))
}

async fn handle_event_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the snapshot so nothing between the two is missed.
    let mut event_rx = state.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let ws_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    info!("[events-ws:{}] Event subscriber connected", ws_id);

    if reply_tx.send(state.state_sync()).is_err() {
        return;
    }

    let ws_id_clone = ws_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(event) = reply_rx.recv() => event,
                received = event_rx.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[events-ws:{}] Lagged by {} events", ws_id_clone, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("[events-ws:{}] Failed to encode event: {}", ws_id_clone, e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                debug!("[events-ws:{}] Failed to send event, closing", ws_id_clone);
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("[events-ws:{}] Receive error: {}", ws_id, e);
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(text.as_str()) {
            Ok(m) => m,
            Err(e) => {
                let _ = reply_tx.send(ServerEvent::Error {
                    error: format!("invalid message: {e}"),
                });
                continue;
            }
        };

        let result = match client_msg {
            ClientMessage::GetState => {
                let _ = reply_tx.send(state.state_sync());
                Ok(())
            }
            ClientMessage::CreatePty(request) => state.create_session(request).map(|_| ()),
            ClientMessage::RenamePty { pty_id, name } => state
                .update_session(
                    &pty_id,
                    UpdateSessionRequest {
                        name: Some(name),
                        ..Default::default()
                    },
                )
                .map(|_| ()),
            ClientMessage::ReorderPty { pty_id, index } => state.reorder_session(&pty_id, index),
            ClientMessage::DeletePty { pty_id } => state.delete_session(&pty_id),
        };

        if let Err(e) = result {
            let _ = reply_tx.send(ServerEvent::Error {
                error: e.to_string(),
            });
        }
    }

    send_task.abort();
    info!("[events-ws:{}] Event subscriber disconnected", ws_id);
}

async fn websocket_terminal(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ServerError> {
    let session = state.get(&id)?;
    Ok(ws.on_upgrade(move |socket| handle_terminal_websocket(socket, session)))
}

async fn handle_terminal_websocket(socket: WebSocket, session: Arc<PtySession>) {
    let (mut sender, mut receiver) = socket.split();
    let session_id = session.id.clone();
    let (scrollback, mut output_rx) = session.subscribe();

    debug!(
        "[term-ws:{}] Connected (scrollback: {} bytes)",
        session_id,
        scrollback.len()
    );

    if !scrollback.is_empty()
        && sender
            .send(Message::Binary(scrollback.into_bytes().into()))
            .await
            .is_err()
    {
        return;
    }

    // The exit frame was sent before we subscribed.
    if session.output_closed() {
        let _ = sender.send(exit_message(session.exit_code())).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    let session_id_clone = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            match output_rx.recv().await {
                Ok(PtyOutput::Data(data)) => {
                    if sender
                        .send(Message::Binary(data.into_bytes().into()))
                        .await
                        .is_err()
                    {
                        debug!("[term-ws:{}] Failed to send output, closing", session_id_clone);
                        return;
                    }
                }
                Ok(PtyOutput::Exit(exit_code)) => {
                    let _ = sender.send(exit_message(exit_code)).await;
                    let _ = sender.send(Message::Close(None)).await;
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "[term-ws:{}] Output subscriber lagged by {} chunks",
                        session_id_clone, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    // Input arrives as raw text/binary frames or as JSON control messages.
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let result = match msg {
                Ok(Message::Binary(data)) => recv_session.write_input(&data),
                Ok(Message::Text(text)) => handle_terminal_text(&recv_session, text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("[term-ws:{}] Receive error: {}", recv_session.id, e);
                    break;
                }
            };
            if let Err(e) = result {
                debug!("[term-ws:{}] Dropped input: {}", recv_session.id, e);
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!("[term-ws:{}] Disconnected", session_id);
}

fn handle_terminal_text(session: &PtySession, text: &str) -> Result<(), ServerError> {
    if text.starts_with('{') {
        if let Ok(control) = serde_json::from_str::<TerminalControl>(text) {
            return match control {
                TerminalControl::Resize { cols, rows } => {
                    debug!("[term-ws:{}] Resize: {}x{}", session.id, cols, rows);
                    session.resize(cols, rows)
                }
                TerminalControl::Input { data } => session.write_input(data.as_bytes()),
            };
        }
    }
    session.write_input(text.as_bytes())
}

fn exit_message(exit_code: Option<i32>) -> Message {
    let json = serde_json::to_string(&ServerEvent::Exit { exit_code })
        .unwrap_or_else(|_| r#"{"type":"exit","exit_code":null}"#.to_string());
    Message::Text(json.into())
}
