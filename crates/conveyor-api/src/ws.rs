//! WebSocket stream of pipeline events.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use conveyor_core::pipeline::PipelineEvent;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let events = state.events().subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
}

/// Forward every event as a JSON text frame until the client goes away.
async fn handle_socket(socket: WebSocket, mut events: broadcast::Receiver<PipelineEvent>) {
    info!("WebSocket connection established");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "WebSocket client lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                // Clients only listen.
                Some(Ok(_)) => {}
            },
        }
    }

    info!("WebSocket connection closed");
}
