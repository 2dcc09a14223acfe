//! Dispatch events and the subscriber fan-out.

use std::sync::Mutex;

use cadence_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::{Execution, QueueItem};

/// Everything observers can learn about the engine's progress.
///
/// Consumed by the pattern executor (to advance executions) and by the host
/// (to record results).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// An item was handed to its class's sender.
    ItemDispatched {
        item: QueueItem,
        timeout_ms: u64,
        timestamp: Timestamp,
    },

    /// An item finished with a confirmed result.
    ItemProcessed {
        item: QueueItem,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: Timestamp,
    },

    /// The safety timeout fired before the item was confirmed.
    ItemTimedOut {
        item: QueueItem,
        timeout_ms: u64,
        timestamp: Timestamp,
    },

    /// A transient send failure; the item was requeued.
    ItemRetrying {
        item: QueueItem,
        retry_count: u32,
        delay_ms: u64,
        error: String,
        timestamp: Timestamp,
    },

    ExecutionStarted {
        execution: Execution,
        timestamp: Timestamp,
    },

    ExecutionCompleted {
        execution: Execution,
        timestamp: Timestamp,
    },

    ExecutionFailed {
        execution: Execution,
        error: String,
        timestamp: Timestamp,
    },

    ExecutionCancelled {
        execution: Execution,
        timestamp: Timestamp,
    },
}

impl DispatchEvent {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            DispatchEvent::ItemDispatched { timestamp, .. }
            | DispatchEvent::ItemProcessed { timestamp, .. }
            | DispatchEvent::ItemTimedOut { timestamp, .. }
            | DispatchEvent::ItemRetrying { timestamp, .. }
            | DispatchEvent::ExecutionStarted { timestamp, .. }
            | DispatchEvent::ExecutionCompleted { timestamp, .. }
            | DispatchEvent::ExecutionFailed { timestamp, .. }
            | DispatchEvent::ExecutionCancelled { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            DispatchEvent::ItemDispatched { .. } => "item-dispatched",
            DispatchEvent::ItemProcessed { .. } => "item-processed",
            DispatchEvent::ItemTimedOut { .. } => "item-timed-out",
            DispatchEvent::ItemRetrying { .. } => "item-retrying",
            DispatchEvent::ExecutionStarted { .. } => "execution-started",
            DispatchEvent::ExecutionCompleted { .. } => "execution-completed",
            DispatchEvent::ExecutionFailed { .. } => "execution-failed",
            DispatchEvent::ExecutionCancelled { .. } => "execution-cancelled",
        }
    }

    /// The queue item this event concerns, for item events.
    pub fn item(&self) -> Option<&QueueItem> {
        match self {
            DispatchEvent::ItemDispatched { item, .. }
            | DispatchEvent::ItemProcessed { item, .. }
            | DispatchEvent::ItemTimedOut { item, .. }
            | DispatchEvent::ItemRetrying { item, .. } => Some(item),
            _ => None,
        }
    }

    pub fn item_id(&self) -> Option<Uuid> {
        self.item().map(QueueItem::id)
    }

    /// The execution this event concerns, for execution events.
    pub fn execution(&self) -> Option<&Execution> {
        match self {
            DispatchEvent::ExecutionStarted { execution, .. }
            | DispatchEvent::ExecutionCompleted { execution, .. }
            | DispatchEvent::ExecutionFailed { execution, .. }
            | DispatchEvent::ExecutionCancelled { execution, .. } => Some(execution),
            _ => None,
        }
    }
}

/// Receiving end of a subscription.
pub type EventStream = mpsc::UnboundedReceiver<DispatchEvent>;

/// Fan-out of [`DispatchEvent`]s to every live subscriber.
///
/// Channels are unbounded so a slow subscriber never loses a completion.
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DispatchEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(tx);
        rx
    }

    /// Deliver to every subscriber, dropping those whose receiver is gone.
    pub fn emit(&self, event: DispatchEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
