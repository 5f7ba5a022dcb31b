//! WebSocket transport
//!
//! GET /ws
//!
//! Every frame is a JSON event, `{"event": <name>, "data": <value>}`.
//! The first frame a client receives is `connected`, carrying its id.
//! Each inbound `chat_message` is handled on its own task, so a slow dual
//! write never holds up the rest of the connection.

use crate::config::AppState;
use crate::error::{ApiError, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use relay_core::{ConnectionId, InboundEvent, MessageIngress, ServerEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<impl IntoResponse> {
    if !state.ingress.drain().is_accepting() {
        return Err(ApiError::Unavailable("server is shutting down".to_string()));
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state.ingress)))
}

async fn handle_socket(socket: WebSocket, ingress: Arc<MessageIngress>) {
    let id = ConnectionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Queued before joining, so it always precedes any broadcast.
    if tx.send(ServerEvent::Connected(id.clone())).is_err() {
        return;
    }
    ingress.hub().join(id.clone(), tx);
    // Upgraded just as shutdown began: `close_all` may already have run.
    if !ingress.drain().is_accepting() {
        ingress.hub().leave(&id);
        return;
    }
    info!(connection_id = %id, "client connected");

    let (mut sink, mut stream) = socket.split();

    // Ends when the hub drops this subscriber (shutdown) or the socket fails.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode event: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let recv_ingress = ingress.clone();
    let recv_id = id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                Message::Text(text) => dispatch(&recv_ingress, &recv_id, text.as_str()),
                Message::Close(_) => break,
                _ => debug!(connection_id = %recv_id, "ignoring non-text frame"),
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    ingress.on_disconnect(&id);
    info!(connection_id = %id, "client disconnected");
}

fn dispatch(ingress: &Arc<MessageIngress>, id: &ConnectionId, text: &str) {
    match serde_json::from_str::<InboundEvent>(text) {
        Ok(InboundEvent::ChatMessage(data)) => {
            let ingress = ingress.clone();
            let id = id.clone();
            tokio::spawn(async move {
                // Outcome already reported to the client and the logs.
                let _ = ingress.on_message(&id, &data).await;
            });
        }
        Err(e) => ingress.on_malformed(id, &e.to_string()),
    }
}
