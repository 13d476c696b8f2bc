// =============================================================================
// WebSocket Handler — event-driven push
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate full StateSnapshot on connect.
//   2. One JSON message per `ObserverEvent` published on the engine's
//      broadcast bus thereafter (SignalEmitted, SignalMaeUpdated,
//      SignalClosed) — no polling, no periodic re-push of the whole
//      snapshot.
//
// The handler also:
//   - Responds to Ping frames with Pong frames.
//   - Tracks a per-connection sequence number that increments on every
//     outbound message.
//   - Updates the shared `ws_user_connected` flag and `last_ws_user_event`
//     timestamp on the ApiState.
//   - Cleans up on disconnect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api_state::ApiState;

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

/// Axum handler for the WebSocket upgrade request.
///
/// Validates the token from the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two concurrent tasks via `tokio::select!`:
///   1. **Push loop** — forward every `ObserverEvent` received from the
///      engine's broadcast bus as a JSON message.
///   2. **Recv loop** — process incoming client messages (Ping/Pong, Close,
///      heartbeat text messages).
async fn handle_ws_connection(socket: WebSocket, state: Arc<ApiState>) {
    {
        *state.ws_user_connected.write() = true;
        *state.last_ws_user_event.write() = std::time::Instant::now();
    }
    state.increment_version();

    let (mut sender, mut receiver) = socket.split();
    use futures_util::{SinkExt, StreamExt};

    let mut sequence: u64 = 0;

    match state.build_snapshot().await {
        Ok(snapshot) => {
            if let Err(e) = send_json(&mut sender, &state, &mut sequence, &snapshot).await {
                warn!(error = %e, "Failed to send initial WebSocket snapshot");
                cleanup(&state);
                return;
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to build initial WebSocket snapshot");
            cleanup(&state);
            return;
        }
    }

    let mut events = state.observer_bus.subscribe();

    loop {
        tokio::select! {
            // ── Push loop: forward engine events as they happen ─────────
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = send_json(&mut sender, &state, &mut sequence, &event).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket subscriber lagged behind the observer bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("Observer bus closed — disconnecting WebSocket");
                        break;
                    }
                }
            }

            // ── Recv loop: process incoming messages ────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message received (heartbeat)");
                        *state.last_ws_user_event.write() = std::time::Instant::now();
                        state.increment_version();
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!("WebSocket Ping received — sending Pong");
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("WebSocket Pong received");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended (None)");
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state);
}

// =============================================================================
// Helpers
// =============================================================================

/// Serialize and send a value over the WebSocket, incrementing the global
/// `ws_sequence_number` on each send.
async fn send_json<S, T>(
    sender: &mut S,
    state: &Arc<ApiState>,
    sequence: &mut u64,
    value: &T,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
    T: serde::Serialize,
{
    use futures_util::SinkExt;

    state
        .ws_sequence_number
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    *sequence += 1;

    match serde_json::to_string(value) {
        Ok(json) => {
            sender.send(Message::Text(json.into())).await?;
            debug!(seq = *sequence, "WebSocket message sent");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Failed to serialize WebSocket message");
            // Serialisation errors are not network errors; don't disconnect.
            Ok(())
        }
    }
}

/// Clean up shared state when a WebSocket connection closes.
fn cleanup(state: &Arc<ApiState>) {
    *state.ws_user_connected.write() = false;
    state.increment_version();
    info!("WebSocket connection closed — cleanup complete");
}
