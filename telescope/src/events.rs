//! Connection state notifications
//!
//! Delivered over a `tokio::sync::broadcast` channel. A slow subscriber
//! receives `Lagged` and skips ahead; publishers never wait.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionEventKind {
    Started,
    Connected,
    /// Sent before the transport is torn down
    Disconnected { reason: String },
    /// Will not be retried
    Failed { reason: String },
    Stopped,
    /// A goto was dropped or replaced without being sent
    GotoDropped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Profile name
    pub id: String,
    pub kind: ConnectionEventKind,
}

/// Sending half shared by every connection
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, id: &str, kind: ConnectionEventKind) {
        tracing::trace!("Event {}: {:?}", id, kind);
        // No subscribers is fine
        let _ = self.sender.send(ConnectionEvent {
            id: id.to_string(),
            kind,
        });
    }
}
