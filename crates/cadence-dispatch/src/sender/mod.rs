//! Sender trait and registry.
//!
//! A sender delivers items of one consumer class to the outside world. It may
//! confirm synchronously (resolve only once the consumer is done) or hand off
//! and let the host report completion later.

pub mod channel;
pub mod log;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::types::ConsumerClass;

use crate::error::SendError;
use crate::types::{QueueItem, SendOutcome};

pub use channel::{ChannelSender, DispatchInstruction};
pub use log::LogSender;

#[async_trait]
pub trait Sender: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn send(&self, item: &QueueItem) -> Result<SendOutcome, SendError>;

    /// Class-specific cleanup after the safety timeout gave up on `item`.
    async fn on_timeout(&self, _item: &QueueItem) {}
}

/// Senders keyed by consumer class.
#[derive(Default, Clone)]
pub struct SenderRegistry {
    senders: HashMap<ConsumerClass, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sender, returning the one it replaced.
    pub fn register(
        &mut self,
        class: impl Into<ConsumerClass>,
        sender: Arc<dyn Sender>,
    ) -> Option<Arc<dyn Sender>> {
        self.senders.insert(class.into(), sender)
    }

    pub fn get(&self, class: &ConsumerClass) -> Option<Arc<dyn Sender>> {
        self.senders.get(class).cloned()
    }

    pub fn classes(&self) -> Vec<ConsumerClass> {
        let mut classes: Vec<_> = self.senders.keys().cloned().collect();
        classes.sort();
        classes
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
