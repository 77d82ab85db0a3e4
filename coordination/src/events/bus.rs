//! Broadcast-based event bus for workflow observability.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::history::EventHistory;
use super::types::WorkflowEvent;

const CHANNEL_CAPACITY: usize = 256;

pub type SharedEventBus = Arc<EventBus>;

/// Broadcasts events to any number of subscribers (a CLI progress printer,
/// a JSON-logs sink) and keeps a bounded in-memory history for post-hoc
/// reporting; it does not persist across process restarts.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
    history: std::sync::Mutex<EventHistory>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: std::sync::Mutex::new(EventHistory::new()),
        }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Records the event in history and broadcasts it. Never fails: a
    /// `send` with no subscribers is a normal, expected condition here, not
    /// an error.
    pub fn publish(&self, event: WorkflowEvent) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(event.clone());
        match self.sender.send(event) {
            Ok(receivers) => debug!(receivers, "event published"),
            Err(_) => debug!("event published with no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn recent(&self, limit: usize) -> Vec<WorkflowEvent> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).recent(limit)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
