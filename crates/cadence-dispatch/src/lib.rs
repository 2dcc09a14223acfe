//! Sequential action-dispatch engine for Cadence.
//!
//! Serializes actions per consumer class so at most one is in flight at a
//! time, enforces cooldowns at admission, runs multi-step patterns on top of
//! the same queues, and guarantees forward progress with per-item safety
//! timeouts.

pub mod admission;
pub mod completion;
pub mod cooldown;
pub mod dedupe;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod pattern;
pub mod queue;
pub mod ratelimit;
pub mod sender;
pub mod timeout;
pub mod types;

pub use cooldown::{CooldownCheck, CooldownRegistry};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, PatternError, QueueError, SendError};
pub use events::{DispatchEvent, EventBus, EventStream};
pub use pattern::{PatternExecutor, PatternLibrary};
pub use sender::{ChannelSender, DispatchInstruction, LogSender, Sender, SenderRegistry};
pub use timeout::{FixedTimeout, MultiPhaseTimeout, TimeoutStrategy};
pub use types::{
    Action, CompletionResult, Execution, ExecutionRef, ExecutionStatus, PatternRequest,
    QueueItem, SendOutcome,
};
