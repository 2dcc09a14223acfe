//! Sender that forwards dispatch instructions to an external consumer.
//!
//! The consumer (an overlay process, a device bridge) reads instructions from
//! the channel and reports completion through `Engine::report_completion`.

use async_trait::async_trait;
use cadence_core::types::ConsumerClass;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SendError;
use crate::sender::Sender;
use crate::types::{QueueItem, SendOutcome};

/// Instruction handed to an external consumer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "instruction", rename_all = "snake_case")]
pub enum DispatchInstruction {
    /// Perform this item and report completion.
    Dispatch { item: QueueItem },
    /// The engine gave up waiting on this item; reset any state held for it.
    Clear { class: ConsumerClass, item_id: Uuid },
}

pub struct ChannelSender {
    name: String,
    tx: mpsc::UnboundedSender<DispatchInstruction>,
}

impl ChannelSender {
    pub fn new(name: impl Into<String>, tx: mpsc::UnboundedSender<DispatchInstruction>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }

    /// Sender plus the receiving end the consumer reads from.
    pub fn pair(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<DispatchInstruction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(name, tx), rx)
    }
}

#[async_trait]
impl Sender for ChannelSender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, item: &QueueItem) -> Result<SendOutcome, SendError> {
        self.tx
            .send(DispatchInstruction::Dispatch { item: item.clone() })
            .map_err(|_| SendError::Permanent(format!("{} consumer disconnected", self.name)))?;
        Ok(SendOutcome::Dispatched)
    }

    async fn on_timeout(&self, item: &QueueItem) {
        let clear = DispatchInstruction::Clear {
            class: item.class.clone(),
            item_id: item.id(),
        };
        if self.tx.send(clear).is_err() {
            tracing::debug!(sender = %self.name, item_id = %item.id(), "Consumer gone, nothing to clear");
        }
    }
}
