//! WebSocket Connection Handler
//!
//! Bridges an upgraded socket to the plugin websocket handler.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::plugin::{WebSocketHandler, WsConnection, WsMessage};

/// Handle a WebSocket connection
pub async fn handle_websocket(socket: WebSocket, handler: Arc<dyn WebSocketHandler>, path: String) {
    let (ws_sender, ws_receiver) = socket.split();
    bridge(ws_sender, ws_receiver, handler, path).await;
}

/// Pump frames between the socket halves and `handler` until either side
/// ends.
async fn bridge<S, R, E>(
    mut ws_sender: S,
    mut ws_receiver: R,
    handler: Arc<dyn WebSocketHandler>,
    path: String,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    // Outgoing messages queued by the handler
    let (tx, mut rx) = mpsc::channel::<WsMessage>(64);
    let conn = WsConnection::new(path, tx);

    if let Err(e) = handler.on_open(&conn).await {
        tracing::warn!("WebSocket open handler failed for {}: {}", conn.id, e);
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match msg {
                WsMessage::Text(text) => Message::Text(text),
                WsMessage::Binary(data) => Message::Binary(data.to_vec()),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let recv_handler = handler.clone();
    let recv_conn = conn.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let message = match msg {
                Message::Text(text) => WsMessage::Text(text),
                Message::Binary(data) => WsMessage::Binary(Bytes::from(data)),
                Message::Close(_) => break,
                // Pong is handled automatically by axum
                _ => continue,
            };
            if let Err(e) = recv_handler.on_message(&recv_conn, message).await {
                tracing::warn!("WebSocket message handler failed for {}: {}", recv_conn.id, e);
            }
        }
    });

    // Handlers may keep `conn` around, so the send side never sees its
    // channel close. Whichever side ends first takes the other down.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if let Err(e) = handler.on_close(&conn).await {
        tracing::warn!("WebSocket close handler failed for {}: {}", conn.id, e);
    }
    tracing::debug!("WebSocket {} closed", conn.id);
}
