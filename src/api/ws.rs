// WebSocket handler for battle state streaming.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use std::sync::Arc;

use crate::live::LiveBattle;
use crate::metrics;

use super::AppState;

/// WebSocket upgrade handler for battle state streaming.
pub async fn ws_battle(
    ws: WebSocketUpgrade,
    Path(session_id): Path<i64>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(battle) = state.battles.get(session_id) else {
        return (StatusCode::NOT_FOUND, "No battle for this session").into_response();
    };
    ws.on_upgrade(move |socket| handle_ws(socket, battle))
        .into_response()
}

async fn handle_ws(mut socket: WebSocket, battle: Arc<LiveBattle>) {
    let mut rx = battle.subscribe();
    metrics::CONNECTED_WEBSOCKETS.inc();

    // Send the current snapshot so late joiners see the battle immediately.
    if socket
        .send(Message::Text(battle.snapshot_json().into()))
        .await
        .is_err()
    {
        metrics::CONNECTED_WEBSOCKETS.dec();
        return;
    }

    // Forward all broadcast messages to the WebSocket client.
    // When the client disconnects or the broadcast channel closes, we stop.
    loop {
        tokio::select! {
            // State message from broadcast channel
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if socket.send(Message::Text(msg.into())).await.is_err() {
                            // Client disconnected
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        // Channel closed, battle evicted
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket client lagged, skipped {n} messages");
                        // Continue receiving
                    }
                }
            }
            // Client message (we mostly ignore, but detect disconnect)
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    _ => {
                        // Ignore other client messages for now
                    }
                }
            }
        }
    }

    metrics::CONNECTED_WEBSOCKETS.dec();
}
