//! Error types for the dispatch engine.

use crate::types::ExecutionStatus;
use cadence_core::error::CadenceError;
use cadence_core::types::{ConsumerClass, ExecutionId};

/// Producer-visible admission failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue for class {class} is full ({capacity} items)")]
    QueueFull { class: ConsumerClass, capacity: usize },
    #[error("Cooldown active, retry in {remaining_ms} ms")]
    CooldownActive { remaining_ms: u64 },
    #[error("Duplicate action: {0}")]
    Duplicate(String),
    #[error("Invalid action: {0}")]
    InvalidAction(String),
    #[error("Unknown consumer class: {0}")]
    UnknownClass(ConsumerClass),
}

impl QueueError {
    /// Stable reason string reported to producers.
    pub fn reason(&self) -> &'static str {
        match self {
            QueueError::QueueFull { .. } => "QueueFull",
            QueueError::CooldownActive { .. } => "CooldownActive",
            QueueError::Duplicate(_) => "Duplicate",
            QueueError::InvalidAction(_) => "InvalidAction",
            QueueError::UnknownClass(_) => "UnknownClass",
        }
    }

    pub fn remaining_ms(&self) -> Option<u64> {
        match self {
            QueueError::CooldownActive { remaining_ms } => Some(*remaining_ms),
            _ => None,
        }
    }
}

/// Errors returned by a [`Sender`](crate::sender::Sender).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Worth retrying after the class retry delay.
    #[error("Transient send failure: {0}")]
    Transient(String),
    #[error("Permanent send failure: {0}")]
    Permanent(String),
}

/// Errors from pattern registration and execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Pattern not found: {0}")]
    UnknownPattern(String),
    #[error("Pattern has no steps: {0}")]
    EmptyPattern(String),
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),
    #[error("Invalid execution transition: {0} -> {1}")]
    InvalidTransition(ExecutionStatus, ExecutionStatus),
    #[error("Pattern step rejected: {0}")]
    Admission(#[from] QueueError),
}

/// Errors surfaced by the [`Engine`](crate::engine::Engine) handle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Core(#[from] CadenceError),
    #[error("No sender registered for class {0}")]
    MissingSender(ConsumerClass),
    #[error("Unknown consumer class: {0}")]
    UnknownClass(ConsumerClass),
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Stable reason string reported to producers.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::Queue(e) => e.reason(),
            EngineError::Pattern(PatternError::Admission(e)) => e.reason(),
            EngineError::Pattern(PatternError::UnknownPattern(_)) => "UnknownPattern",
            EngineError::Pattern(PatternError::EmptyPattern(_)) => "EmptyPattern",
            EngineError::Pattern(PatternError::ExecutionNotFound(_)) => "ExecutionNotFound",
            EngineError::Pattern(PatternError::InvalidTransition(..)) => "InvalidTransition",
            EngineError::Core(_) => "Config",
            EngineError::MissingSender(_) => "MissingSender",
            EngineError::UnknownClass(_) => "UnknownClass",
            EngineError::ShuttingDown => "ShuttingDown",
        }
    }

    pub fn remaining_ms(&self) -> Option<u64> {
        match self {
            EngineError::Queue(e) | EngineError::Pattern(PatternError::Admission(e)) => {
                e.remaining_ms()
            }
            _ => None,
        }
    }
}
