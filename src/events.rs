//! In-process pub/sub for observational events.
//!
//! Publishing never blocks and never fails: with no subscribers the
//! event is dropped, and a subscriber that falls behind skips events
//! (the skip count is measured). Nothing here sits on the request
//! dispatch critical path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::TransportKind;

/// Default subscriber buffer depth.
const EVENT_BUFFER: usize = 256;

/// Observational server events.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A transport accepted a connection.
    ConnectionOpened {
        connection_id: Uuid,
        transport: TransportKind,
    },
    /// A connection fully closed.
    ConnectionClosed {
        connection_id: Uuid,
        transport: TransportKind,
        reason: String,
    },
    /// A request passed validation and acquired its slots.
    RequestAccepted {
        correlation_id: Uuid,
        method: String,
    },
    /// A response was produced (success or error).
    RequestCompleted {
        correlation_id: Uuid,
        method: String,
        error_code: Option<i32>,
        elapsed_ms: u64,
    },
    /// A tool module registered.
    ToolRegistered { namespace: String, tools: usize },
    /// The server began draining.
    ServerDraining,
}

/// Broadcast fan-out of [`ServerEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
    dropped: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Non-blocking; drops when nobody listens.
    pub fn publish(&self, event: ServerEvent) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribe to the stream. Each subscriber gets its own cursor;
    /// lagging subscribers skip the overwritten events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Events dropped for lack of any subscriber.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
