use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Newtype Wrappers - Identity
// =============================================================================

/// Unique identifier for one running instance of a pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of a logical category of downstream consumer with its own single-flight queue.
///
/// Always stored trimmed and lower-cased so `"Overlay"` and `"overlay"` name
/// the same class.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ConsumerClass(String);

impl ConsumerClass {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConsumerClass {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for ConsumerClass {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<ConsumerClass> for String {
    fn from(value: ConsumerClass) -> Self {
        value.0
    }
}

impl fmt::Display for ConsumerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Newtype Wrappers - Temporal
// =============================================================================

/// Unix timestamp in milliseconds since epoch.
///
/// Wall-clock only. Scheduling decisions use a monotonic clock instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }

    /// Milliseconds from now until this timestamp, or zero if it has passed.
    pub fn millis_until(&self) -> u64 {
        u64::try_from(self.0.saturating_sub(Timestamp::now().0)).unwrap_or(0)
    }
}

// =============================================================================
// Pattern Definitions
// =============================================================================

/// Template for an action emitted by a pattern step.
///
/// The target, user and source are filled in from the execution that runs it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub kind: String,
    #[serde(default)]
    pub intensity: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub priority: i32,
    /// Explicit consumer class; routed by kind when absent.
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl ActionTemplate {
    pub fn new(kind: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            kind: kind.into(),
            intensity: 0,
            duration_ms,
            priority: 0,
            class: None,
            payload: serde_json::Value::Null,
        }
    }
}

/// One step of a pattern: either an action to dispatch or a plain pause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Action(ActionTemplate),
    Pause { duration_ms: u64 },
}

/// A reusable, read-only ordered sequence of steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub steps: Vec<Step>,
}

impl PatternDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            steps,
        }
    }

    /// Sum of every action duration and pause in one pass over the steps.
    pub fn nominal_duration_ms(&self) -> u64 {
        self.steps
            .iter()
            .map(|step| match step {
                Step::Action(template) => template.duration_ms,
                Step::Pause { duration_ms } => *duration_ms,
            })
            .sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
