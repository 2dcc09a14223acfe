//! Per-class dispatch loop.
//!
//! Each consumer class runs exactly one loop. The loop takes the next eligible
//! item, hands it to the class's sender and does not take another until the
//! item is confirmed or its safety timeout fires.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::ClassConfig;
use cadence_core::types::Timestamp;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::completion::CompletionTracker;
use crate::error::SendError;
use crate::events::{DispatchEvent, EventBus};
use crate::queue::{ClassQueue, Next};
use crate::ratelimit::DispatchRateLimiter;
use crate::sender::Sender;
use crate::timeout::TimeoutStrategy;
use crate::types::{CompletionResult, QueueItem, SendOutcome};

/// Resolve once shutdown has been requested or the signal's sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// How a dispatched item left the in-flight state.
enum Settled {
    Confirmed(CompletionResult),
    Failed(SendError),
    TimedOut,
    Shutdown,
}

pub struct DispatchLoop {
    queue: Arc<ClassQueue>,
    config: ClassConfig,
    safety_margin: Duration,
    sender: Arc<dyn Sender>,
    timeout: Arc<dyn TimeoutStrategy>,
    completions: Arc<CompletionTracker>,
    bus: Arc<EventBus>,
}

impl DispatchLoop {
    pub fn new(
        queue: Arc<ClassQueue>,
        config: ClassConfig,
        safety_margin: Duration,
        sender: Arc<dyn Sender>,
        timeout: Arc<dyn TimeoutStrategy>,
        completions: Arc<CompletionTracker>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            queue,
            config,
            safety_margin,
            sender,
            timeout,
            completions,
            bus,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Minimum time from one dispatch to the next for `item`.
    pub fn pacing(&self, item: &QueueItem) -> Duration {
        let min_delay = Duration::from_millis(self.config.min_processing_delay_ms);
        let busy_for = Duration::from_millis(item.action.duration_ms) + self.safety_margin;
        min_delay.max(busy_for)
    }

    /// Safety timeout for `item`. Never shorter than its pacing.
    pub fn timeout_for(&self, item: &QueueItem) -> Duration {
        self.timeout.timeout_for(item).max(self.pacing(item))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let class = self.queue.class().clone();
        info!(class = %class, sender = %self.sender.name(), "Dispatch loop started");

        let mut limiter = DispatchRateLimiter::new(self.config.max_dispatches_per_minute);
        while let Some(item) = self.next_item(&mut limiter, &mut shutdown).await {
            if !self.process(item, &mut shutdown).await {
                break;
            }
        }

        self.queue.set_busy(false);
        info!(class = %class, "Dispatch loop stopped");
    }

    /// Wait for the next eligible item. `None` on shutdown.
    async fn next_item(
        &self,
        limiter: &mut DispatchRateLimiter,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<QueueItem> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let now = Instant::now();
            if let Some(ready_at) = limiter.next_available(now) {
                debug!(class = %self.queue.class(), "Rate limit reached, waiting");
                tokio::select! {
                    _ = sleep_until(ready_at) => continue,
                    _ = wait_for_shutdown(shutdown) => return None,
                }
            }

            match self.queue.take(now) {
                Next::Ready(item) => {
                    limiter.try_acquire(now);
                    return Some(item);
                }
                Next::Wait(at) => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        _ = sleep_until(at) => {}
                        _ = wait_for_shutdown(shutdown) => return None,
                    }
                }
                Next::Empty => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        _ = wait_for_shutdown(shutdown) => return None,
                    }
                }
            }
        }
    }

    /// Send the item and wait for it to settle. Returns `false` on shutdown.
    async fn process(&self, mut item: QueueItem, shutdown: &mut watch::Receiver<bool>) -> bool {
        let item_id = item.id();
        let start = Instant::now();
        let pacing = self.pacing(&item);
        let timeout = self.timeout_for(&item);

        let completion = self.completions.register(item_id);
        self.bus.emit(DispatchEvent::ItemDispatched {
            item: item.clone(),
            timeout_ms: duration_ms(timeout),
            timestamp: Timestamp::now(),
        });
        debug!(
            class = %item.class,
            item_id = %item_id,
            kind = %item.action.kind,
            timeout_ms = duration_ms(timeout),
            "Dispatching item"
        );

        let settled = tokio::select! {
            result = self.deliver(&item, completion) => match result {
                Ok(result) => Settled::Confirmed(result),
                Err(e) => Settled::Failed(e),
            },
            _ = sleep_until(start + timeout) => Settled::TimedOut,
            _ = wait_for_shutdown(shutdown) => Settled::Shutdown,
        };

        self.completions.forget(item_id);

        match settled {
            Settled::Confirmed(result) => {
                self.queue.release(None);
                debug!(
                    class = %item.class,
                    item_id = %item_id,
                    success = result.success,
                    "Item confirmed"
                );
                self.bus.emit(DispatchEvent::ItemProcessed {
                    item,
                    success: result.success,
                    error: if result.success { None } else { result.message },
                    timestamp: Timestamp::now(),
                });
                // Hold the class until the action has had time to play out.
                tokio::select! {
                    _ = sleep_until(start + pacing) => true,
                    _ = wait_for_shutdown(shutdown) => false,
                }
            }
            Settled::TimedOut => {
                self.queue.release(None);
                warn!(
                    class = %item.class,
                    item_id = %item_id,
                    timeout_ms = duration_ms(timeout),
                    "Safety timeout fired before confirmation"
                );
                self.sender.on_timeout(&item).await;
                self.bus.emit(DispatchEvent::ItemTimedOut {
                    item,
                    timeout_ms: duration_ms(timeout),
                    timestamp: Timestamp::now(),
                });
                true
            }
            Settled::Failed(SendError::Transient(message))
                if item.action.retry_count < self.config.max_retries =>
            {
                item.action.retry_count += 1;
                let delay = Duration::from_millis(self.config.retry_delay_ms);
                warn!(
                    class = %item.class,
                    item_id = %item_id,
                    retry_count = item.action.retry_count,
                    error = %message,
                    "Transient send failure, retrying"
                );
                self.queue
                    .release(Some((item.clone(), Instant::now() + delay)));
                self.bus.emit(DispatchEvent::ItemRetrying {
                    retry_count: item.action.retry_count,
                    item,
                    delay_ms: duration_ms(delay),
                    error: message,
                    timestamp: Timestamp::now(),
                });
                true
            }
            Settled::Failed(e) => {
                self.queue.release(None);
                error!(
                    class = %item.class,
                    item_id = %item_id,
                    retry_count = item.action.retry_count,
                    error = %e,
                    "Item dropped"
                );
                self.bus.emit(DispatchEvent::ItemProcessed {
                    item,
                    success: false,
                    error: Some(e.to_string()),
                    timestamp: Timestamp::now(),
                });
                true
            }
            Settled::Shutdown => {
                self.queue.release(None);
                false
            }
        }
    }

    async fn deliver(
        &self,
        item: &QueueItem,
        completion: oneshot::Receiver<CompletionResult>,
    ) -> Result<CompletionResult, SendError> {
        match self.sender.send(item).await? {
            SendOutcome::Confirmed => Ok(CompletionResult::ok()),
            SendOutcome::Dispatched => match completion.await {
                Ok(result) => Ok(result),
                // Slot dropped without a report; leave it to the safety timeout.
                Err(_) => std::future::pending().await,
            },
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
