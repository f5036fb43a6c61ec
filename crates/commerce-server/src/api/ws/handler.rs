//! `WS /ws/events/{session_id}` — relays the Event Bus to one subscriber,
//! sending an opaque heartbeat every 25s and closing idle sockets after 5m
//! without client activity (§4.10, §6), grounded on the teacher's
//! `ClientTimeout`/`TimeoutManager` tick-based idle tracking.

use crate::api::routes::AppState;
use crate::api::ws::timeout::{HEARTBEAT_INTERVAL, IDLE_TIMEOUT};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;

pub async fn ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let subscription = state.orchestrator.subscribe(&session_id);
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; consume it

    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break, // session closed server-side
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > IDLE_TIMEOUT {
                    tracing::debug!(session_id, "closing idle websocket");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                if sender.send(Message::Ping(b"ping".to_vec())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => last_activity = Instant::now(),
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
