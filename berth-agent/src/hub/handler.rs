//! Websocket endpoint for status subscribers.
//!
//! Authentication happens in the middleware stack before the upgrade; by
//! the time the socket opens the client is trusted. The write loop drains
//! the client's hub queue; the read loop exists only to observe the close.

use super::connection::StatusClient;
use crate::state::AppState;
use axum::{
    extract::State,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

pub async fn status_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (client, mut queue) = StatusClient::new();
    let client_id = client.id;
    state.hub.register(client);

    let (mut sink, mut stream) = socket.split();
    let shutdown = state.shutdown.clone();

    let mut write_task = tokio::spawn(async move {
        loop {
            let payload = tokio::select! {
                payload = queue.recv() => payload,
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            // `None` means the hub evicted this client.
            let Some(payload) = payload else {
                let _ = sink.send(Message::Close(None)).await;
                break;
            };
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut write_task => read_task.abort(),
        _ = &mut read_task => write_task.abort(),
    }

    state.hub.deregister(client_id);
    debug!(client = %client_id, "status websocket closed");
}
