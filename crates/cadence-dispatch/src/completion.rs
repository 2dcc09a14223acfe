//! Out-of-band completion tracking.
//!
//! A dispatch loop registers a slot before handing an item to its sender.
//! `report_completion` from the host resolves the slot; a safety timeout
//! forgets it.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::types::CompletionResult;

pub struct CompletionTracker {
    slots: Mutex<HashMap<Uuid, oneshot::Sender<CompletionResult>>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Open a slot for `item_id`, replacing any earlier one.
    pub fn register(&self, item_id: Uuid) -> oneshot::Receiver<CompletionResult> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(item_id, tx);
        rx
    }

    /// Resolve the slot for `item_id`. Returns `false` if nothing was waiting.
    pub fn complete(&self, item_id: Uuid, result: CompletionResult) -> bool {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.remove(&item_id)
        };
        match slot {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, item_id: Uuid) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&item_id);
    }

    pub fn is_pending(&self, item_id: Uuid) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.contains_key(&item_id)
    }

    pub fn pending(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.len()
    }
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}
