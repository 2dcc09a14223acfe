//! Execution bookkeeping for the pattern executor.
//!
//! Holds every running execution plus a bounded history of finished ones.

pub mod state_machine;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use cadence_core::types::{ExecutionId, PatternDefinition, Timestamp};
use uuid::Uuid;

use crate::error::PatternError;
use crate::execution::state_machine::validate_transition;
use crate::types::{Execution, ExecutionStatus};

/// What a running execution is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    Idle,
    Item { item_id: Uuid, token: u64 },
    Pause { token: u64 },
}

/// An execution together with the runtime state the executor needs.
#[derive(Debug, Clone)]
pub struct Run {
    pub execution: Execution,
    pub pattern: Arc<PatternDefinition>,
    pub awaiting: Awaiting,
}

impl Run {
    pub fn new(execution: Execution, pattern: Arc<PatternDefinition>) -> Self {
        Self {
            execution,
            pattern,
            awaiting: Awaiting::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.execution.status == ExecutionStatus::Running
    }
}

pub struct ExecutionStore {
    runs: HashMap<ExecutionId, Run>,
    finished: VecDeque<ExecutionId>,
    history: usize,
}

impl ExecutionStore {
    /// `history` bounds how many finished executions stay queryable.
    pub fn new(history: usize) -> Self {
        Self {
            runs: HashMap::new(),
            finished: VecDeque::new(),
            history,
        }
    }

    pub fn insert(&mut self, run: Run) {
        self.runs.insert(run.execution.id, run);
    }

    pub fn get(&self, id: ExecutionId) -> Option<&Run> {
        self.runs.get(&id)
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> Option<&mut Run> {
        self.runs.get_mut(&id)
    }

    pub fn execution(&self, id: ExecutionId) -> Option<Execution> {
        self.runs.get(&id).map(|run| run.execution.clone())
    }

    /// Move an execution to a finished state and trim the history.
    pub fn finish(
        &mut self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<Execution, PatternError> {
        let run = self
            .runs
            .get_mut(&id)
            .ok_or(PatternError::ExecutionNotFound(id))?;

        validate_transition(run.execution.status, status)?;

        run.execution.status = status;
        run.execution.finished_at = Some(Timestamp::now());
        run.execution.error = error;
        run.awaiting = Awaiting::Idle;
        let execution = run.execution.clone();

        self.finished.push_back(id);
        while self.finished.len() > self.history {
            if let Some(oldest) = self.finished.pop_front() {
                self.runs.remove(&oldest);
            }
        }

        Ok(execution)
    }

    /// Executions in the given status, oldest first.
    pub fn list(&self, status: Option<ExecutionStatus>) -> Vec<Execution> {
        let mut result: Vec<Execution> = self
            .runs
            .values()
            .filter(|run| status.map_or(true, |s| run.execution.status == s))
            .map(|run| run.execution.clone())
            .collect();
        result.sort_by_key(|e| e.started_at);
        result
    }

    pub fn running_count(&self) -> usize {
        self.runs.values().filter(|run| run.is_running()).count()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
