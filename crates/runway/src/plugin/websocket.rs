//! WebSocket handlers contributed by plugins.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Message exchanged over a plugin websocket.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
}

/// One open websocket, as seen by handlers.
#[derive(Debug, Clone)]
pub struct WsConnection {
    pub id: Uuid,
    /// Request path the upgrade came in on.
    pub path: String,
    tx: mpsc::Sender<WsMessage>,
}

impl WsConnection {
    pub fn new(path: impl Into<String>, tx: mpsc::Sender<WsMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            tx,
        }
    }

    /// Queue a message for the client. False once the socket is gone.
    pub async fn send(&self, message: WsMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }
}

#[async_trait]
pub trait WebSocketHandler: Send + Sync {
    async fn on_open(&self, _conn: &WsConnection) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_message(&self, conn: &WsConnection, message: WsMessage) -> anyhow::Result<()>;

    async fn on_close(&self, _conn: &WsConnection) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Forwards every event to all handlers. A failing handler is logged and
/// does not keep the others from seeing the event.
pub struct FanOut {
    handlers: Vec<(String, Arc<dyn WebSocketHandler>)>,
}

impl FanOut {
    pub fn new(handlers: Vec<(String, Arc<dyn WebSocketHandler>)>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl WebSocketHandler for FanOut {
    async fn on_open(&self, conn: &WsConnection) -> anyhow::Result<()> {
        for (plugin, handler) in &self.handlers {
            if let Err(e) = handler.on_open(conn).await {
                warn!(plugin = %plugin, "websocket open handler failed: {}", e);
            }
        }
        Ok(())
    }

    async fn on_message(&self, conn: &WsConnection, message: WsMessage) -> anyhow::Result<()> {
        for (plugin, handler) in &self.handlers {
            if let Err(e) = handler.on_message(conn, message.clone()).await {
                warn!(plugin = %plugin, "websocket message handler failed: {}", e);
            }
        }
        Ok(())
    }

    async fn on_close(&self, conn: &WsConnection) -> anyhow::Result<()> {
        for (plugin, handler) in &self.handlers {
            if let Err(e) = handler.on_close(conn).await {
                warn!(plugin = %plugin, "websocket close handler failed: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        messages: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl WebSocketHandler for Counting {
        async fn on_message(&self, _conn: &WsConnection, _message: WsMessage) -> anyhow::Result<()> {
            self.messages.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_handler() {
        let failing = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(Counting::default());
        let fan_out = FanOut::new(vec![
            ("a".into(), failing.clone() as Arc<dyn WebSocketHandler>),
            ("b".into(), healthy.clone() as Arc<dyn WebSocketHandler>),
        ]);

        let (tx, _rx) = mpsc::channel(1);
        let conn = WsConnection::new("/chat", tx);
        fan_out
            .on_message(&conn, WsMessage::Text("hi".into()))
            .await
            .unwrap();

        assert_eq!(failing.messages.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.messages.load(Ordering::SeqCst), 1);
    }
}
