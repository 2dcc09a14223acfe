//! Execution state machine with validated transitions.
//!
//! Running -> Completed/Failed/Cancelled. Finished states are terminal.

use crate::error::PatternError;
use crate::types::ExecutionStatus;

/// Validate that a status transition is allowed.
pub fn validate_transition(from: ExecutionStatus, to: ExecutionStatus) -> Result<(), PatternError> {
    let valid = matches!(
        (from, to),
        (ExecutionStatus::Running, ExecutionStatus::Completed)
            | (ExecutionStatus::Running, ExecutionStatus::Failed)
            | (ExecutionStatus::Running, ExecutionStatus::Cancelled)
    );

    if valid {
        Ok(())
    } else {
        Err(PatternError::InvalidTransition(from, to))
    }
}
