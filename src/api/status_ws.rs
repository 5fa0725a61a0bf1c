// =============================================================================
// Status WebSocket — push-only operational event feed
// =============================================================================
//
// `/ws/status` pushes the execution-relevant subset of the event bus:
// order fills/rejections/cancels, flattens, missed heartbeats, safety stops,
// and hard kills. No inbound commands beyond Ping/Pong.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::app_state::AppState;

pub async fn status_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_status_connection(socket, state))
}

async fn handle_status_connection(socket: WebSocket, state: Arc<AppState>) {
    info!("status client connected");
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) if event.on_status_feed() => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "status subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!("status client disconnected");
}
