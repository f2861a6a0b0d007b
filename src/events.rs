// Completion notifications
// The sink is told about every item that reaches a terminal state so it can
// archive or relocate the backlog entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{ItemOutcome, WorkItem};

pub const EVENT_ITEM_COMPLETED: &str = "item:completed";
pub const EVENT_ITEM_FAILED: &str = "item:failed";

/// Payload for item completion events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub item: WorkItem,
    pub outcome: ItemOutcome,
    pub finished_at: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn new(item: WorkItem, outcome: ItemOutcome) -> Self {
        Self {
            item,
            outcome,
            finished_at: Utc::now(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self.outcome {
            ItemOutcome::Completed => EVENT_ITEM_COMPLETED,
            _ => EVENT_ITEM_FAILED,
        }
    }
}

pub trait CompletionSink: Send + Sync {
    fn notify(&self, event: CompletionEvent);
}

/// Writes one log line per event
pub struct LogSink;

impl CompletionSink for LogSink {
    fn notify(&self, event: CompletionEvent) {
        log::info!(
            "[Events] {} {} ({})",
            event.event_name(),
            event.item.id,
            serde_json::to_string(&event.outcome).unwrap_or_default()
        );
    }
}

/// Forwards events to an async consumer
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<CompletionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompletionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl CompletionSink for ChannelSink {
    fn notify(&self, event: CompletionEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("[Events] Completion receiver dropped");
        }
    }
}
