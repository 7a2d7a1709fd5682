//! WebSocket subscribers.
//!
//! Each upgraded socket is split: the write half becomes a [`SnapshotSink`]
//! owned by the hub, the read half is drained here only to notice when the
//! peer goes away. Inbound messages carry no meaning.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::debug;

use replmon_core::hub::{BroadcastHub, SinkError, SnapshotSink};
use replmon_core::model::Snapshot;

pub(crate) struct WebSocketSink {
    tx: Mutex<SplitSink<WebSocket, Message>>,
}

impl WebSocketSink {
    pub(crate) fn new(tx: SplitSink<WebSocket, Message>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

#[async_trait]
impl SnapshotSink for WebSocketSink {
    async fn send(&self, snapshot: Arc<Snapshot>) -> Result<(), SinkError> {
        let json = serde_json::to_string(snapshot.as_ref())
            .map_err(|e| SinkError::Encode(e.to_string()))?;
        // The lock serialises a welcome write racing a tick write.
        self.tx
            .lock()
            .await
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SinkError::Write(e.to_string()))
    }

    async fn close(&self) {
        let mut tx = self.tx.lock().await;
        let _ = tx.send(Message::Close(None)).await;
        let _ = tx.close().await;
    }
}

/// Registers `socket` with the hub and holds it until the peer disconnects.
pub(crate) async fn serve_subscriber(hub: Arc<BroadcastHub>, socket: WebSocket) {
    let (tx, mut rx) = socket.split();

    let id = match hub.subscribe(Arc::new(WebSocketSink::new(tx))).await {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "subscriber rejected");
            return;
        }
    };

    while let Some(frame) = rx.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(subscriber = id, error = %e, "websocket read failed");
                break;
            }
        }
    }

    hub.unregister(id).await;
}
