//! Pattern library and executor.
//!
//! An execution walks a pattern's steps one at a time. Action steps are
//! admitted to their class queue and the executor waits for the item to be
//! processed or to time out; pause steps wait on a plain timer. Repetitions
//! run back to back, each to completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cadence_core::types::{ActionTemplate, ExecutionId, PatternDefinition, Step, Timestamp};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{Admission, CooldownPolicy};
use crate::dispatcher::wait_for_shutdown;
use crate::error::{PatternError, QueueError};
use crate::events::{DispatchEvent, EventBus, EventStream};
use crate::execution::{Awaiting, ExecutionStore, Run};
use crate::types::{Action, Execution, ExecutionRef, ExecutionStatus, PatternRequest};

// =============================================================================
// Library
// =============================================================================

/// Read-only pattern definitions keyed by case-insensitive id.
#[derive(Default)]
pub struct PatternLibrary {
    patterns: HashMap<String, Arc<PatternDefinition>>,
}

fn library_key(id: &str) -> String {
    id.trim().to_lowercase()
}

impl PatternLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = PatternDefinition>,
    ) -> Result<Self, PatternError> {
        let mut library = Self::new();
        for definition in definitions {
            library.register(definition)?;
        }
        Ok(library)
    }

    /// Add or replace a pattern.
    pub fn register(&mut self, definition: PatternDefinition) -> Result<(), PatternError> {
        let key = library_key(&definition.id);
        if key.is_empty() {
            return Err(PatternError::UnknownPattern(definition.id));
        }
        if definition.steps.is_empty() {
            return Err(PatternError::EmptyPattern(definition.id));
        }
        self.patterns.insert(key, Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<PatternDefinition>> {
        self.patterns.get(&library_key(id)).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.patterns.values().map(|p| p.id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Turn a step template into an action for `execution`.
///
/// The execution context is attached under `"context"` when the template
/// payload is an object or empty.
fn step_action(template: &ActionTemplate, execution: &Execution) -> Action {
    let mut payload = template.payload.clone();
    if !execution.context.is_null() {
        if payload.is_null() {
            payload = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = payload.as_object_mut() {
            map.insert("context".to_string(), execution.context.clone());
        }
    }

    Action {
        id: Uuid::new_v4(),
        target_id: execution.target_id.clone(),
        kind: template.kind.clone(),
        intensity: template.intensity,
        duration_ms: template.duration_ms,
        priority: template.priority,
        user_id: execution.user_id.clone(),
        source: execution.source.clone(),
        scheduled_at: None,
        retry_count: 0,
        class: template.class.clone(),
        dedupe_key: None,
        payload,
    }
}

// =============================================================================
// Executor
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct PauseElapsed {
    execution_id: ExecutionId,
    token: u64,
}

pub struct PatternExecutor {
    library: RwLock<PatternLibrary>,
    store: Mutex<ExecutionStore>,
    admission: Arc<Admission>,
    bus: Arc<EventBus>,
    pause_tx: mpsc::UnboundedSender<PauseElapsed>,
    max_repeat_count: u32,
    next_token: AtomicU64,
}

impl PatternExecutor {
    /// Create the executor and spawn the task that drives its executions.
    pub fn start(
        library: PatternLibrary,
        admission: Arc<Admission>,
        bus: Arc<EventBus>,
        max_repeat_count: u32,
        history: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (pause_tx, pause_rx) = mpsc::unbounded_channel();
        let events = bus.subscribe();
        let executor = Arc::new(Self {
            library: RwLock::new(library),
            store: Mutex::new(ExecutionStore::new(history)),
            admission,
            bus,
            pause_tx,
            max_repeat_count: max_repeat_count.max(1),
            next_token: AtomicU64::new(1),
        });
        let handle = tokio::spawn(Arc::clone(&executor).run(events, pause_rx, shutdown));
        (executor, handle)
    }

    fn store(&self) -> std::sync::MutexGuard<'_, ExecutionStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_pattern(&self, definition: PatternDefinition) -> Result<(), PatternError> {
        let mut library = self.library.write().unwrap_or_else(|e| e.into_inner());
        library.register(definition)
    }

    pub fn pattern_ids(&self) -> Vec<String> {
        let library = self.library.read().unwrap_or_else(|e| e.into_inner());
        library.ids()
    }

    pub fn execution(&self, id: ExecutionId) -> Option<Execution> {
        self.store().execution(id)
    }

    pub fn executions(&self, status: Option<ExecutionStatus>) -> Vec<Execution> {
        self.store().list(status)
    }

    /// Start a new execution and its first step.
    ///
    /// The trigger passes through the cooldown registry once, keyed by the
    /// pattern id; individual steps do not.
    pub fn execute(&self, request: PatternRequest) -> Result<ExecutionId, PatternError> {
        let pattern = {
            let library = self.library.read().unwrap_or_else(|e| e.into_inner());
            library
                .get(&request.pattern_id)
                .ok_or_else(|| PatternError::UnknownPattern(request.pattern_id.clone()))?
        };
        if pattern.steps.is_empty() {
            return Err(PatternError::EmptyPattern(pattern.id.clone()));
        }
        let target_id = request.target_id.trim().to_string();
        if target_id.is_empty() {
            return Err(QueueError::InvalidAction("target_id must not be empty".to_string()).into());
        }

        self.admission
            .reserve_trigger(&pattern.id, &target_id, request.user_id.as_deref())?;

        let repeat_count = request.repeat_count.clamp(1, self.max_repeat_count);
        let execution = Execution {
            id: ExecutionId::new(),
            pattern_id: pattern.id.clone(),
            target_id,
            user_id: request.user_id,
            source: request.source,
            repeat_count,
            remaining_repeats: repeat_count - 1,
            current_step_index: 0,
            status: ExecutionStatus::Running,
            dispatched_steps: 0,
            context: request.context,
            started_at: Timestamp::now(),
            finished_at: None,
            error: None,
        };
        let id = execution.id;

        info!(
            execution_id = %id,
            pattern_id = %execution.pattern_id,
            target_id = %execution.target_id,
            repeat_count,
            "Execution started"
        );

        let mut store = self.store();
        self.bus.emit(DispatchEvent::ExecutionStarted {
            execution: execution.clone(),
            timestamp: Timestamp::now(),
        });
        store.insert(Run::new(execution, pattern));
        self.start_step(&mut store, id);
        Ok(id)
    }

    /// Cancel a running execution.
    ///
    /// Whatever step is in flight still runs to completion or timeout; nothing
    /// further is enqueued.
    pub fn cancel(&self, id: ExecutionId) -> Result<Execution, PatternError> {
        let mut store = self.store();
        let execution = store.finish(id, ExecutionStatus::Cancelled, None)?;
        info!(
            execution_id = %id,
            step = execution.current_step_index,
            "Execution cancelled"
        );
        self.bus.emit(DispatchEvent::ExecutionCancelled {
            execution: execution.clone(),
            timestamp: Timestamp::now(),
        });
        Ok(execution)
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Start the step at the execution's current index.
    fn start_step(&self, store: &mut ExecutionStore, id: ExecutionId) {
        let Some(run) = store.get_mut(id) else {
            return;
        };
        if !run.is_running() {
            return;
        }
        let index = run.execution.current_step_index;
        let Some(step) = run.pattern.steps.get(index).cloned() else {
            return;
        };
        let token = self.next_token();

        match step {
            Step::Pause { duration_ms } => {
                run.awaiting = Awaiting::Pause { token };
                debug!(execution_id = %id, step = index, duration_ms, "Pause step started");
                let tx = self.pause_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(duration_ms)).await;
                    let _ = tx.send(PauseElapsed {
                        execution_id: id,
                        token,
                    });
                });
            }
            Step::Action(template) => {
                let action = step_action(&template, &run.execution);
                let reference = ExecutionRef {
                    execution_id: id,
                    step_token: token,
                };
                match self
                    .admission
                    .admit(action, Some(reference), CooldownPolicy::Bypass)
                {
                    Ok(item) => {
                        run.awaiting = Awaiting::Item {
                            item_id: item.id(),
                            token,
                        };
                        run.execution.dispatched_steps += 1;
                        debug!(
                            execution_id = %id,
                            step = index,
                            item_id = %item.id(),
                            class = %item.class,
                            "Action step enqueued"
                        );
                    }
                    Err(e) => self.fail(store, id, format!("step {} rejected: {}", index, e)),
                }
            }
        }
    }

    /// Move past the finished step: next step, next repetition, or done.
    fn advance(&self, store: &mut ExecutionStore, id: ExecutionId) {
        let Some(run) = store.get_mut(id) else {
            return;
        };
        if !run.is_running() {
            return;
        }
        run.awaiting = Awaiting::Idle;
        run.execution.current_step_index += 1;

        if run.execution.current_step_index >= run.pattern.steps.len() {
            if run.execution.remaining_repeats == 0 {
                // A finished execution points at its last step.
                run.execution.current_step_index = run.pattern.steps.len() - 1;
                match store.finish(id, ExecutionStatus::Completed, None) {
                    Ok(execution) => {
                        info!(
                            execution_id = %id,
                            dispatched_steps = execution.dispatched_steps,
                            "Execution completed"
                        );
                        self.bus.emit(DispatchEvent::ExecutionCompleted {
                            execution,
                            timestamp: Timestamp::now(),
                        });
                    }
                    Err(e) => warn!(execution_id = %id, error = %e, "Could not complete execution"),
                }
                return;
            }
            run.execution.remaining_repeats -= 1;
            run.execution.current_step_index = 0;
            debug!(
                execution_id = %id,
                remaining_repeats = run.execution.remaining_repeats,
                "Starting next repetition"
            );
        }

        self.start_step(store, id);
    }

    fn fail(&self, store: &mut ExecutionStore, id: ExecutionId, error: String) {
        match store.finish(id, ExecutionStatus::Failed, Some(error.clone())) {
            Ok(execution) => {
                warn!(execution_id = %id, error = %error, "Execution failed");
                self.bus.emit(DispatchEvent::ExecutionFailed {
                    execution,
                    error,
                    timestamp: Timestamp::now(),
                });
            }
            Err(e) => debug!(execution_id = %id, error = %e, "Execution already finished"),
        }
    }

    /// An item produced by an execution step has left the in-flight state.
    fn on_item_settled(&self, reference: ExecutionRef, item_id: Uuid, outcome: Result<(), String>) {
        let mut store = self.store();
        let id = reference.execution_id;
        let Some(run) = store.get(id) else {
            return;
        };
        if !run.is_running() {
            debug!(execution_id = %id, item_id = %item_id, "Step settled after execution finished");
            return;
        }
        let expected = Awaiting::Item {
            item_id,
            token: reference.step_token,
        };
        if run.awaiting != expected {
            debug!(execution_id = %id, item_id = %item_id, "Ignoring stale step signal");
            return;
        }

        match outcome {
            Ok(()) => self.advance(&mut store, id),
            Err(error) => self.fail(&mut store, id, error),
        }
    }

    fn on_pause_elapsed(&self, pause: PauseElapsed) {
        let mut store = self.store();
        let id = pause.execution_id;
        let Some(run) = store.get(id) else {
            return;
        };
        if !run.is_running() || run.awaiting != (Awaiting::Pause { token: pause.token }) {
            return;
        }
        self.advance(&mut store, id);
    }

    fn on_event(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::ItemProcessed {
                item,
                success,
                error,
                ..
            } => {
                if let Some(reference) = item.execution {
                    let outcome = if *success {
                        Ok(())
                    } else {
                        Err(error
                            .clone()
                            .unwrap_or_else(|| "step reported failure".to_string()))
                    };
                    self.on_item_settled(reference, item.id(), outcome);
                }
            }
            // A timed-out step counts as done for progress purposes.
            DispatchEvent::ItemTimedOut { item, .. } => {
                if let Some(reference) = item.execution {
                    self.on_item_settled(reference, item.id(), Ok(()));
                }
            }
            _ => {}
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: EventStream,
        mut pauses: mpsc::UnboundedReceiver<PauseElapsed>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Pattern executor started");
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.on_event(&event),
                Some(pause) = pauses.recv() => self.on_pause_elapsed(pause),
                _ = wait_for_shutdown(&mut shutdown) => break,
                else => break,
            }
        }
        info!("Pattern executor stopped");
    }
}
