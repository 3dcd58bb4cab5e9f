//! HTTP surface: the realtime voice WebSocket plus a health probe.
//!
//! The socket carries binary audio frames upstream and JSON text frames
//! in both directions. Transport concerns stay here; everything stateful
//! lives in the session supervisor.

use crate::pipeline::messages::AudioFrame;
use crate::pipeline::{InboundMessage, SessionSupervisor};
use crate::protocol::{ClientMessage, ServerEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

const INBOUND_CHANNEL_SIZE: usize = 64;
const OUTBOUND_CHANNEL_SIZE: usize = 256;

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// Session orchestrator; owns the backend stack.
    pub supervisor: Arc<SessionSupervisor>,
}

/// Build the router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/voice/stream", get(ws_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.supervisor.registry().len(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridge one WebSocket to a supervisor session.
///
/// The socket splits into a reader feeding the inbound channel and a
/// writer task draining server events as JSON text frames. Dropping the
/// inbound sender (client disconnect) ends the session; the supervisor's
/// `session_closed` event is the last frame written.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(INBOUND_CHANNEL_SIZE);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CHANNEL_SIZE);

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("unserializable server event dropped: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let inbound = match message {
                Message::Binary(bytes) => InboundMessage::Audio(AudioFrame { bytes }),
                Message::Text(text) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(control) => InboundMessage::Control(control),
                        Err(e) => {
                            debug!("ignoring malformed client message: {e}");
                            continue;
                        }
                    }
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if inbound_tx.send(inbound).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = state
        .supervisor
        .run_session(session_id, inbound_rx, outbound_tx)
        .await
    {
        warn!("session {session_id} ended with error: {e}");
    }

    reader.abort();
    let _ = writer.await;
    let _ = reader.await;
}
