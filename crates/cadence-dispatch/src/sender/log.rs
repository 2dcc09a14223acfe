//! Sender that logs each dispatch and confirms after the action's duration.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SendError;
use crate::sender::Sender;
use crate::types::{QueueItem, SendOutcome};

/// Stand-in consumer for classes with no real actuator attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

impl LogSender {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, item: &QueueItem) -> Result<SendOutcome, SendError> {
        let action = &item.action;
        tracing::info!(
            class = %item.class,
            item_id = %action.id,
            target_id = %action.target_id,
            kind = %action.kind,
            intensity = action.intensity,
            duration_ms = action.duration_ms,
            "Action dispatched"
        );
        tokio::time::sleep(Duration::from_millis(action.duration_ms)).await;
        Ok(SendOutcome::Confirmed)
    }
}
