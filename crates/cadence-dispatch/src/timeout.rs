//! Safety timeout strategies.
//!
//! Each consumer class supplies the longest time its dispatch loop waits for a
//! confirmation before moving on regardless.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use cadence_core::config::TimeoutConfig;

use crate::types::QueueItem;

pub trait TimeoutStrategy: Send + Sync {
    fn timeout_for(&self, item: &QueueItem) -> Duration;
}

impl<F> TimeoutStrategy for F
where
    F: Fn(&QueueItem) -> Duration + Send + Sync,
{
    fn timeout_for(&self, item: &QueueItem) -> Duration {
        self(item)
    }
}

/// The item's own duration plus a fixed margin.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeout {
    margin: Duration,
}

impl FixedTimeout {
    pub fn new(margin: Duration) -> Self {
        Self { margin }
    }
}

impl TimeoutStrategy for FixedTimeout {
    fn timeout_for(&self, item: &QueueItem) -> Duration {
        Duration::from_millis(item.action.duration_ms) + self.margin
    }
}

/// Sum of every phase plus a buffer, for interactions made of several waits.
///
/// Phases can be replaced at runtime; the value is read at dispatch time.
#[derive(Debug)]
pub struct MultiPhaseTimeout {
    phases: RwLock<Vec<Duration>>,
    buffer: Duration,
}

impl MultiPhaseTimeout {
    pub fn new(phases: Vec<Duration>, buffer: Duration) -> Self {
        Self {
            phases: RwLock::new(phases),
            buffer,
        }
    }

    pub fn set_phases(&self, phases: Vec<Duration>) {
        let mut current = self.phases.write().unwrap_or_else(|e| e.into_inner());
        *current = phases;
    }

    pub fn total(&self) -> Duration {
        let phases = self.phases.read().unwrap_or_else(|e| e.into_inner());
        phases.iter().sum::<Duration>() + self.buffer
    }
}

impl TimeoutStrategy for MultiPhaseTimeout {
    fn timeout_for(&self, _item: &QueueItem) -> Duration {
        self.total()
    }
}

/// Build the strategy configured for a class.
pub fn from_config(config: &TimeoutConfig, safety_margin: Duration) -> Arc<dyn TimeoutStrategy> {
    match config {
        TimeoutConfig::Fixed => Arc::new(FixedTimeout::new(safety_margin)),
        TimeoutConfig::MultiPhase { phases_ms, buffer_ms } => Arc::new(MultiPhaseTimeout::new(
            phases_ms.iter().copied().map(Duration::from_millis).collect(),
            Duration::from_millis(*buffer_ms),
        )),
    }
}
