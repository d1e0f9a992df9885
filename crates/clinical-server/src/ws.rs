//! WebSocket endpoint for the encounter delta stream hubs.
//!
//! Provides a `/ws/{channel}` route per stream channel, forwarding flushed
//! deltas from a [`StreamHub`] subscription to the client as JSON text
//! frames. Inbound client messages are not read, matching the upstream
//! hub's transport: disconnects are detected when a send fails.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

/// Query parameters for `/ws/{channel}`.
#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(rename = "encounterId", alias = "encounter_id")]
    encounter_id: Option<String>,
}

/// `GET /ws/{channel}?encounterId=...` — WebSocket upgrade onto one
/// encounter's delta stream for the named channel.
pub async fn ws_handler(
    Path(channel): Path<String>,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let hub = state
        .hubs
        .get(channel.as_str())
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("unknown stream channel: {channel}")))?;

    let encounter_id = params
        .encounter_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing encounterId query parameter".to_string()))?;

    Ok(ws.on_upgrade(move |socket| handle_ws(socket, hub, channel, encounter_id)))
}

async fn handle_ws(mut socket: WebSocket, hub: Arc<clinical_core::streams::StreamHub>, channel: String, encounter_id: String) {
    let handshake = json!({ "event": "connected", "channel": channel, "encounterId": encounter_id }).to_string();
    if socket.send(Message::Text(handshake.into())).await.is_err() {
        return;
    }

    let mut subscription = match hub.subscribe(&encounter_id).await {
        Ok(subscription) => subscription,
        Err(err) => {
            tracing::warn!(channel, encounter_id, error = %err, "subscribe failed");
            let _ = socket.close().await;
            return;
        }
    };

    loop {
        match subscription.receiver.recv().await {
            Some(event) => {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::error!(channel, encounter_id, error = %err, "failed to serialize delta event");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }

    hub.unsubscribe(&encounter_id, subscription.id).await;
    tracing::debug!(channel, encounter_id, "websocket connection closed");
}
