//! Engine handle.
//!
//! Wires the admission gate, one dispatch loop per consumer class, and the
//! pattern executor, and exposes the operations producers and the host use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::config::CadenceConfig;
use cadence_core::types::{ConsumerClass, ExecutionId, PatternDefinition};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::{Admission, CooldownPolicy};
use crate::completion::CompletionTracker;
use crate::dispatcher::DispatchLoop;
use crate::error::EngineError;
use crate::events::{EventBus, EventStream};
use crate::pattern::{PatternExecutor, PatternLibrary};
use crate::queue::ClassQueue;
use crate::sender::{Sender, SenderRegistry};
use crate::timeout::{self, TimeoutStrategy};
use crate::types::{Action, CompletionResult, Execution, ExecutionStatus, PatternRequest, QueueItem};

pub struct EngineBuilder {
    config: CadenceConfig,
    senders: SenderRegistry,
    timeouts: HashMap<ConsumerClass, Arc<dyn TimeoutStrategy>>,
    patterns: Vec<PatternDefinition>,
}

impl EngineBuilder {
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            config,
            senders: SenderRegistry::new(),
            timeouts: HashMap::new(),
            patterns: Vec::new(),
        }
    }

    pub fn sender(mut self, class: impl Into<ConsumerClass>, sender: Arc<dyn Sender>) -> Self {
        self.senders.register(class, sender);
        self
    }

    /// Override the configured safety timeout strategy for a class.
    pub fn timeout(
        mut self,
        class: impl Into<ConsumerClass>,
        strategy: Arc<dyn TimeoutStrategy>,
    ) -> Self {
        self.timeouts.insert(class.into(), strategy);
        self
    }

    pub fn pattern(mut self, definition: PatternDefinition) -> Self {
        self.patterns.push(definition);
        self
    }

    /// Validate the configuration and spawn every background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Engine, EngineError> {
        let EngineBuilder {
            config,
            senders,
            mut timeouts,
            patterns,
        } = self;
        config.validate()?;

        let classes = config.class_names();
        for class in senders.classes() {
            if !classes.contains(&class) {
                return Err(EngineError::UnknownClass(class));
            }
        }
        for class in timeouts.keys() {
            if !classes.contains(class) {
                return Err(EngineError::UnknownClass(class.clone()));
            }
        }

        let library = PatternLibrary::from_definitions(
            config.patterns.iter().cloned().chain(patterns),
        )?;

        let mut queues = HashMap::new();
        let mut loops = Vec::new();
        let bus = Arc::new(EventBus::new());
        let completions = Arc::new(CompletionTracker::new());
        let safety_margin = Duration::from_millis(config.dispatch.safety_margin_ms);

        for class in &classes {
            let class_config = config
                .class(class)
                .cloned()
                .ok_or_else(|| EngineError::UnknownClass(class.clone()))?;
            let sender = senders
                .get(class)
                .ok_or_else(|| EngineError::MissingSender(class.clone()))?;
            let strategy = timeouts
                .remove(class)
                .unwrap_or_else(|| timeout::from_config(&class_config.timeout, safety_margin));
            let queue = Arc::new(ClassQueue::new(class.clone(), class_config.max_queue_size));
            queues.insert(class.clone(), queue.clone());
            loops.push(DispatchLoop::new(
                queue,
                class_config,
                safety_margin,
                sender,
                strategy,
                completions.clone(),
                bus.clone(),
            ));
        }

        let admission = Arc::new(Admission::new(&config, queues));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles: Vec<JoinHandle<()>> = loops
            .into_iter()
            .map(|dispatch| dispatch.spawn(shutdown_rx.clone()))
            .collect();
        let (executor, executor_handle) = PatternExecutor::start(
            library,
            admission.clone(),
            bus.clone(),
            config.dispatch.max_repeat_count,
            config.dispatch.execution_history,
            shutdown_rx,
        );
        handles.push(executor_handle);

        info!(
            classes = classes.len(),
            patterns = executor.pattern_ids().len(),
            "Dispatch engine started"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                admission,
                executor,
                completions,
                bus,
                classes,
                shutdown_tx,
                shutting_down: AtomicBool::new(false),
                handles: Mutex::new(handles),
            }),
        })
    }
}

struct EngineInner {
    admission: Arc<Admission>,
    executor: Arc<PatternExecutor>,
    completions: Arc<CompletionTracker>,
    bus: Arc<EventBus>,
    classes: Vec<ConsumerClass>,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: CadenceConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn class_queue(&self, class: &ConsumerClass) -> Result<&Arc<ClassQueue>, EngineError> {
        self.inner
            .admission
            .queue(class)
            .ok_or_else(|| EngineError::UnknownClass(class.clone()))
    }

    /// Admit a single action. Returns the queued item.
    pub fn enqueue_action(&self, action: Action) -> Result<QueueItem, EngineError> {
        self.ensure_running()?;
        Ok(self
            .inner
            .admission
            .admit(action, None, CooldownPolicy::Enforce)?)
    }

    pub fn execute_pattern(&self, request: PatternRequest) -> Result<ExecutionId, EngineError> {
        self.ensure_running()?;
        Ok(self.inner.executor.execute(request)?)
    }

    pub fn cancel_execution(&self, id: ExecutionId) -> Result<Execution, EngineError> {
        Ok(self.inner.executor.cancel(id)?)
    }

    /// Deliver an out-of-band completion. Returns `false` if no dispatch was
    /// waiting on `item_id`.
    pub fn report_completion(&self, item_id: Uuid, result: CompletionResult) -> bool {
        let matched = self.inner.completions.complete(item_id, result);
        if !matched {
            warn!(item_id = %item_id, "Completion report for unknown or expired item");
        }
        matched
    }

    pub fn subscribe(&self) -> EventStream {
        self.inner.bus.subscribe()
    }

    pub fn execution(&self, id: ExecutionId) -> Option<Execution> {
        self.inner.executor.execution(id)
    }

    pub fn executions(&self, status: Option<ExecutionStatus>) -> Vec<Execution> {
        self.inner.executor.executions(status)
    }

    pub fn register_pattern(&self, definition: PatternDefinition) -> Result<(), EngineError> {
        Ok(self.inner.executor.register_pattern(definition)?)
    }

    pub fn pattern_ids(&self) -> Vec<String> {
        self.inner.executor.pattern_ids()
    }

    pub fn queue_len(&self, class: &ConsumerClass) -> Result<usize, EngineError> {
        Ok(self.class_queue(class)?.len())
    }

    pub fn is_busy(&self, class: &ConsumerClass) -> Result<bool, EngineError> {
        Ok(self.class_queue(class)?.is_busy())
    }

    /// True when the class has nothing queued, nothing in flight, and no
    /// retry pending.
    pub fn is_idle(&self, class: &ConsumerClass) -> Result<bool, EngineError> {
        Ok(self.class_queue(class)?.is_idle())
    }

    pub fn classes(&self) -> &[ConsumerClass] {
        &self.inner.classes
    }

    /// Stop accepting work and wait for every background task to finish.
    ///
    /// Items still queued are dropped.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Dispatch engine shutting down");
        let _ = self.inner.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Dispatch engine stopped");
    }
}
