//! HTTP and WebSocket surface served by the leader.
//!
//! `/ws` accepts browser transports; `/api/*` and `/health` are consumed by
//! standbys and by local tooling. The HTTP handlers go through the abstract
//! [`RouterHandle`], never the registry directly — the same code path tool
//! execution uses, regardless of role.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::error::RelayError;
use crate::protocol::{
    BrowserMessage, CommandEnvelope, CommandRequest, PageMetadata, SessionInfo,
};
use crate::registry::TRANSPORT_CHANNEL_CAPACITY;
use crate::routing::{LeaderRouter, RouterHandle};
use crate::shutdown::ShutdownCoordinator;

#[derive(Clone)]
pub struct AppState {
    /// Abstract routing handle; what tool code and HTTP handlers call.
    pub handle: RouterHandle,
    /// Concrete leader internals; only the WebSocket boundary needs them.
    pub leader: LeaderRouter,
    pub shutdown: ShutdownCoordinator,
    pub settings: Settings,
}

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/api/connections", get(list_connections))
        .route("/api/command", post(run_command))
        .route("/ws", get(ws_browser))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let connections = state.handle.current().connections().await.len();
    Json(json!({
        "status": "ok",
        "role": state.handle.role().to_string(),
        "connections": connections,
    }))
}

async fn list_connections(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.handle.current().connections().await)
}

async fn run_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<Value>, RelayError> {
    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.settings.command_timeout);
    let router = state.handle.current();
    let data = router
        .send_command(&req.session_id, req.command, timeout)
        .await?;
    Ok(Json(json!({ "success": true, "data": data })))
}

async fn ws_browser(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_browser_socket(socket, state))
}

/// One browser transport's lifetime: a writer task draining the envelope
/// channel into the socket, and a read loop classifying inbound messages.
///
/// Messages from this transport are handled strictly in arrival order by
/// this single loop; no ordering exists across transports.
async fn handle_browser_socket(socket: WebSocket, state: AppState) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (ws_tx, mut ws_rx) = socket.split();

    let (out_tx, out_rx) = mpsc::channel::<CommandEnvelope>(TRANSPORT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let writer = tokio::spawn(write_loop(
        ws_tx,
        out_rx,
        cancel.clone(),
        state.shutdown.subscribe(),
    ));

    // Identity is unknown until the first page_info arrives.
    let mut session: Option<(String, u64)> = None;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BrowserMessage>(text.as_str()) {
                            Ok(message) => {
                                handle_message(&state, &out_tx, &cancel, &mut session, message);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping malformed browser message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "browser socket error");
                        break;
                    }
                }
            }
            // Fired when a reconnect replaced this transport or the sweep
            // evicted the session.
            _ = cancel.cancelled() => break,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Epoch-guarded removal: if a reconnect already replaced this
    // transport, the new registration stays untouched.
    if let Some((session_id, epoch)) = session {
        state
            .leader
            .registry
            .remove_connection_if_epoch(&session_id, epoch);
    }
    cancel.cancel();
    let _ = writer.await;
}

async fn write_loop(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<CommandEnvelope>,
    cancel: CancellationToken,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            envelope = out_rx.recv() => {
                let Some(envelope) = envelope else { break };
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize command envelope");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => {
                let close = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "transport replaced or evicted".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close))).await;
                break;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let close = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "server shutting down".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close))).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }
}

/// Classify one inbound message and mutate registry/dispatcher state.
fn handle_message(
    state: &AppState,
    out_tx: &mpsc::Sender<CommandEnvelope>,
    cancel: &CancellationToken,
    session: &mut Option<(String, u64)>,
    message: BrowserMessage,
) {
    match message {
        BrowserMessage::PageInfo { session_id, payload } => {
            match session {
                Some((current, _)) if *current == session_id => {
                    // Same identity: plain metadata update.
                    state
                        .leader
                        .registry
                        .update_connection_info(&session_id, &payload);
                }
                _ => {
                    // First page_info on this transport, or navigation
                    // assigned a fresh id. Drop any prior registration of
                    // this transport before installing the new identity.
                    if let Some((old_id, epoch)) = session.take() {
                        state
                            .leader
                            .registry
                            .remove_connection_if_epoch(&old_id, epoch);
                    }
                    let epoch = state.leader.registry.register(
                        &session_id,
                        out_tx.clone(),
                        cancel.clone(),
                        &payload,
                    );
                    *session = Some((session_id, epoch));
                }
            }
        }
        BrowserMessage::Heartbeat { session_id, payload } => {
            let meta = PageMetadata {
                url: payload.url,
                title: payload.title,
                user_agent: None,
            };
            if !state.leader.registry.update_connection_info(&session_id, &meta) {
                tracing::debug!(session_id, "heartbeat for unknown session");
            }
        }
        BrowserMessage::CommandResponse {
            session_id,
            command_id,
            success,
            data,
            error,
        } => {
            state
                .leader
                .dispatcher
                .complete(&session_id, &command_id, success, data, error);
            state.leader.registry.touch(&session_id);
        }
    }
}
