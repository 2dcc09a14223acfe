//! Core types and value objects for the dispatch engine.
//!
//! Defines actions, queue items, executions, and the results exchanged with
//! senders.

use cadence_core::types::{ConsumerClass, ExecutionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle states of a pattern execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            _ => Err(format!("Unknown execution status: {}", s)),
        }
    }
}

/// What a sender reports once `send` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    /// The consumer finished the action before `send` returned.
    Confirmed,
    /// The action was handed off; completion arrives later through
    /// `Engine::report_completion`.
    Dispatched,
}

// =============================================================================
// Domain Structs
// =============================================================================

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub target_id: String,
    pub kind: String,
    #[serde(default)]
    pub intensity: u32,
    #[serde(default)]
    pub duration_ms: u64,
    /// Higher runs first; equal priorities run in arrival order.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Not eligible before this wall-clock time.
    #[serde(default)]
    pub scheduled_at: Option<Timestamp>,
    #[serde(default)]
    pub retry_count: u32,
    /// Explicit consumer class. Routed by kind when absent.
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Action {
    pub fn new(target_id: impl Into<String>, kind: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id: target_id.into(),
            kind: kind.into(),
            intensity: 0,
            duration_ms,
            priority: 0,
            user_id: None,
            source: None,
            scheduled_at: None,
            retry_count: 0,
            class: None,
            dedupe_key: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_intensity(mut self, intensity: u32) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_scheduled_at(mut self, at: Timestamp) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Back-reference from a queued item to the execution step that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRef {
    pub execution_id: ExecutionId,
    /// Token of the step that enqueued the item. Signals carrying an older
    /// token are stale.
    pub step_token: u64,
}

/// An admitted action waiting in, or taken from, a class queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub action: Action,
    pub class: ConsumerClass,
    pub enqueued_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionRef>,
}

impl QueueItem {
    pub fn new(action: Action, class: ConsumerClass) -> Self {
        Self {
            action,
            class,
            enqueued_at: Timestamp::now(),
            execution: None,
        }
    }

    /// The item id is the action id and survives retries.
    pub fn id(&self) -> Uuid {
        self.action.id
    }
}

/// Result of an out-of-band completion report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl CompletionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Producer request to run a named pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRequest {
    pub pattern_id: String,
    pub target_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    #[serde(default)]
    pub context: serde_json::Value,
}

fn default_repeat_count() -> u32 {
    1
}

impl PatternRequest {
    pub fn new(pattern_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            target_id: target_id.into(),
            user_id: None,
            source: None,
            repeat_count: 1,
            context: serde_json::Value::Null,
        }
    }

    pub fn with_repeat(mut self, repeat_count: u32) -> Self {
        self.repeat_count = repeat_count;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Runtime state of one pattern run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub pattern_id: String,
    pub target_id: String,
    pub user_id: Option<String>,
    pub source: Option<String>,
    /// Total repetitions requested, after clamping.
    pub repeat_count: u32,
    /// Repetitions still to run after the current one.
    pub remaining_repeats: u32,
    pub current_step_index: usize,
    pub status: ExecutionStatus,
    /// Action steps admitted to a queue so far, across all repetitions.
    pub dispatched_steps: u32,
    #[serde(default)]
    pub context: serde_json::Value,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub error: Option<String>,
}
