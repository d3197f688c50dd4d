//! Event bus
//!
//! Process-wide broadcast of request summaries. Every `report_*` call on a
//! capture record publishes the current summary here; WebSocket sessions
//! subscribe and forward. Subscribers only see summaries published after
//! they subscribe; delivery is lossy only for lagging consumers.

use tokio::sync::broadcast;

use super::model::RequestSummary;

/// Buffered summaries per subscriber before lag-skipping kicks in.
const BUS_CAPACITY: usize = 1024;

/// Broadcast channel for request summaries.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RequestSummary>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes a summary to all current subscribers.
    ///
    /// A send with no subscribers is not an error; summaries are simply
    /// dropped until someone is listening.
    pub fn publish(&self, summary: RequestSummary) {
        let _ = self.sender.send(summary);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RequestSummary> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
