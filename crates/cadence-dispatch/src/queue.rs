//! Per-class action queue.
//!
//! Items are ordered by priority (highest first) and then by arrival. Items
//! whose eligibility instant lies in the future are skipped until it passes.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use cadence_core::types::ConsumerClass;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::QueueItem;

type QueueKey = (Reverse<i32>, u64);

struct Entry {
    item: QueueItem,
    eligible_at: Instant,
}

/// Result of [`ActionQueue::pop_eligible`].
#[derive(Debug)]
pub enum Next {
    Ready(QueueItem),
    /// Nothing eligible yet; the earliest item becomes eligible at this instant.
    Wait(Instant),
    Empty,
}

/// Ordered buffer of pending items for one consumer class.
pub struct ActionQueue {
    class: ConsumerClass,
    capacity: usize,
    entries: BTreeMap<QueueKey, Entry>,
    next_seq: u64,
}

impl ActionQueue {
    pub fn new(class: ConsumerClass, capacity: usize) -> Self {
        Self {
            class,
            capacity,
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn insert(&mut self, item: QueueItem, eligible_at: Instant) {
        let key = (Reverse(item.action.priority), self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, Entry { item, eligible_at });
    }

    /// Admit a new item.
    ///
    /// Capacity is checked first, then `gate` runs. The item is inserted only
    /// if both pass, so a rejected item has no side effects beyond whatever
    /// `gate` itself chose to do.
    pub fn try_push<F>(&mut self, item: QueueItem, eligible_at: Instant, gate: F) -> Result<(), QueueError>
    where
        F: FnOnce(&QueueItem) -> Result<(), QueueError>,
    {
        if self.entries.len() >= self.capacity {
            return Err(QueueError::QueueFull {
                class: self.class.clone(),
                capacity: self.capacity,
            });
        }
        gate(&item)?;
        self.insert(item, eligible_at);
        Ok(())
    }

    /// Re-insert a retried item behind every queued item of equal priority.
    ///
    /// Ignores capacity.
    pub fn requeue(&mut self, item: QueueItem, eligible_at: Instant) {
        self.insert(item, eligible_at);
    }

    /// Take the highest-ranked item that is eligible at `now`.
    pub fn pop_eligible(&mut self, now: Instant) -> Next {
        let mut earliest: Option<Instant> = None;
        let mut ready: Option<QueueKey> = None;

        for (key, entry) in &self.entries {
            if entry.eligible_at <= now {
                ready = Some(*key);
                break;
            }
            earliest = Some(earliest.map_or(entry.eligible_at, |e| e.min(entry.eligible_at)));
        }

        if let Some(key) = ready {
            if let Some(entry) = self.entries.remove(&key) {
                return Next::Ready(entry.item);
            }
        }
        match earliest {
            Some(at) => Next::Wait(at),
            None => Next::Empty,
        }
    }

    /// Pending item ids in dispatch order, ignoring eligibility.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.entries.values().map(|e| e.item.id()).collect()
    }
}

/// A class queue shared between producers and the class's dispatch loop.
pub struct ClassQueue {
    class: ConsumerClass,
    queue: Mutex<ActionQueue>,
    wake: Notify,
    busy: AtomicBool,
}

impl ClassQueue {
    pub fn new(class: ConsumerClass, capacity: usize) -> Self {
        Self {
            queue: Mutex::new(ActionQueue::new(class.clone(), capacity)),
            class,
            wake: Notify::new(),
            busy: AtomicBool::new(false),
        }
    }

    pub fn class(&self) -> &ConsumerClass {
        &self.class
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ActionQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit an item and wake the dispatch loop. See [`ActionQueue::try_push`].
    pub fn push<F>(&self, item: QueueItem, eligible_at: Instant, gate: F) -> Result<(), QueueError>
    where
        F: FnOnce(&QueueItem) -> Result<(), QueueError>,
    {
        self.lock().try_push(item, eligible_at, gate)?;
        self.wake.notify_one();
        Ok(())
    }

    pub fn pop_eligible(&self, now: Instant) -> Next {
        self.lock().pop_eligible(now)
    }

    /// Pop for dispatch. A ready item marks the class busy under the same lock.
    pub fn take(&self, now: Instant) -> Next {
        let mut queue = self.lock();
        let next = queue.pop_eligible(now);
        if matches!(next, Next::Ready(_)) {
            self.busy.store(true, Ordering::SeqCst);
        }
        next
    }

    /// Clear the busy flag, first requeueing `retry` if given.
    ///
    /// Both happen under the queue lock, so [`is_idle`](Self::is_idle) never
    /// sees a retried item as gone.
    pub fn release(&self, retry: Option<(QueueItem, Instant)>) {
        let retried = retry.is_some();
        {
            let mut queue = self.lock();
            if let Some((item, eligible_at)) = retry {
                queue.requeue(item, eligible_at);
            }
            self.busy.store(false, Ordering::SeqCst);
        }
        if retried {
            self.wake.notify_one();
        }
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        let queue = self.lock();
        queue.is_empty() && !self.busy.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.lock().pending_ids()
    }

    /// Resolves after the next push or requeue.
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}
