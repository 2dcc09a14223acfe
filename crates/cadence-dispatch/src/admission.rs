//! Action admission: normalisation, routing, and the cooldown/dedupe gate.
//!
//! Every producer path (single actions and pattern steps) goes through
//! [`Admission::admit`], so each consumer class has exactly one entry point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::{CadenceConfig, CooldownConfig, DispatchConfig, LimitsConfig};
use cadence_core::types::ConsumerClass;
use tokio::time::Instant;
use tracing::debug;

use crate::cooldown::{scope_requests, CooldownRegistry};
use crate::dedupe::Deduper;
use crate::error::QueueError;
use crate::queue::ClassQueue;
use crate::types::{Action, ExecutionRef, QueueItem};

/// Upper bound on how far ahead a `scheduled_at` can park an item.
const MAX_SCHEDULE_AHEAD: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Whether an admission passes through the cooldown registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownPolicy {
    Enforce,
    /// Steps of a running execution; the trigger already paid the cooldown.
    Bypass,
}

pub struct Admission {
    dispatch: DispatchConfig,
    limits: LimitsConfig,
    cooldown_config: CooldownConfig,
    cooldowns: CooldownRegistry,
    deduper: Option<Deduper>,
    queues: HashMap<ConsumerClass, Arc<ClassQueue>>,
}

impl Admission {
    pub fn new(config: &CadenceConfig, queues: HashMap<ConsumerClass, Arc<ClassQueue>>) -> Self {
        let deduper = (config.dispatch.dedupe_ttl_ms > 0)
            .then(|| Deduper::new(Duration::from_millis(config.dispatch.dedupe_ttl_ms)));
        Self {
            dispatch: config.dispatch.clone(),
            limits: config.limits.clone(),
            cooldown_config: config.cooldowns.clone(),
            cooldowns: CooldownRegistry::new(),
            deduper,
            queues,
        }
    }

    pub fn queue(&self, class: &ConsumerClass) -> Option<&Arc<ClassQueue>> {
        self.queues.get(class)
    }

    pub fn cooldowns(&self) -> &CooldownRegistry {
        &self.cooldowns
    }

    /// Normalise identifiers and clamp numeric fields to the configured limits.
    pub fn sanitize(&self, mut action: Action) -> Result<Action, QueueError> {
        action.kind = action.kind.trim().to_lowercase();
        action.target_id = action.target_id.trim().to_string();
        if action.kind.is_empty() {
            return Err(QueueError::InvalidAction("kind must not be empty".to_string()));
        }
        if action.target_id.is_empty() {
            return Err(QueueError::InvalidAction(
                "target_id must not be empty".to_string(),
            ));
        }

        let limits = &self.limits;
        let duration_ms = action
            .duration_ms
            .clamp(limits.min_duration_ms, limits.max_duration_ms);
        let intensity = action.intensity.min(limits.max_intensity);
        let priority = action.priority.clamp(limits.min_priority, limits.max_priority);

        if duration_ms != action.duration_ms
            || intensity != action.intensity
            || priority != action.priority
        {
            debug!(
                action_id = %action.id,
                duration_ms,
                intensity,
                priority,
                "Action clamped to configured limits"
            );
        }
        action.duration_ms = duration_ms;
        action.intensity = intensity;
        action.priority = priority;
        Ok(action)
    }

    /// Explicit class, then the route for the kind, then the default class.
    pub fn route(&self, action: &Action) -> Result<ConsumerClass, QueueError> {
        let class = match action.class.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(explicit) => ConsumerClass::new(explicit),
            None => self
                .dispatch
                .route(&action.kind)
                .unwrap_or_else(|| ConsumerClass::new(&self.dispatch.default_class)),
        };
        if self.queues.contains_key(&class) {
            Ok(class)
        } else {
            Err(QueueError::UnknownClass(class))
        }
    }

    /// Validate, route and enqueue an action.
    ///
    /// Inside the queue lock: capacity, then dedupe, then cooldown reserve,
    /// then the dedupe key is remembered. A rejected action never consumes a
    /// cooldown slot.
    pub fn admit(
        &self,
        action: Action,
        execution: Option<ExecutionRef>,
        policy: CooldownPolicy,
    ) -> Result<QueueItem, QueueError> {
        let action = self.sanitize(action)?;
        let class = self.route(&action)?;
        let queue = self
            .queues
            .get(&class)
            .ok_or_else(|| QueueError::UnknownClass(class.clone()))?;

        let now = Instant::now();
        let eligible_at = match action.scheduled_at {
            Some(at) => now
                .checked_add(Duration::from_millis(at.millis_until()))
                .unwrap_or(now + MAX_SCHEDULE_AHEAD),
            None => now,
        };

        let mut item = QueueItem::new(action, class);
        item.execution = execution;

        let requests = match policy {
            CooldownPolicy::Enforce => scope_requests(
                self.cooldown_config.intervals_for(&item.action.kind),
                &item.action.target_id,
                item.action.user_id.as_deref(),
            ),
            CooldownPolicy::Bypass => Vec::new(),
        };

        queue.push(item.clone(), eligible_at, |candidate| {
            let now = Instant::now();
            let dedupe_key = candidate.action.dedupe_key.as_deref();
            if let (Some(deduper), Some(key)) = (&self.deduper, dedupe_key) {
                if deduper.is_duplicate(key, now) {
                    return Err(QueueError::Duplicate(key.to_string()));
                }
            }
            if !requests.is_empty() {
                let check = self.cooldowns.check_and_reserve_at(&requests, now);
                if !check.allowed {
                    return Err(QueueError::CooldownActive {
                        remaining_ms: check.remaining_ms(),
                    });
                }
            }
            if let (Some(deduper), Some(key)) = (&self.deduper, dedupe_key) {
                deduper.remember(key, now);
            }
            Ok(())
        })?;

        debug!(
            item_id = %item.id(),
            class = %item.class,
            kind = %item.action.kind,
            priority = item.action.priority,
            "Action admitted"
        );
        Ok(item)
    }

    /// Pass a pattern trigger through the cooldown registry, keyed by pattern id.
    pub fn reserve_trigger(
        &self,
        pattern_id: &str,
        target_id: &str,
        user_id: Option<&str>,
    ) -> Result<(), QueueError> {
        let requests = scope_requests(
            self.cooldown_config.intervals_for(pattern_id),
            target_id.trim(),
            user_id,
        );
        let check = self.cooldowns.check_and_reserve(&requests);
        if check.allowed {
            Ok(())
        } else {
            Err(QueueError::CooldownActive {
                remaining_ms: check.remaining_ms(),
            })
        }
    }
}
