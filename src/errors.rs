//! Typed error hierarchy for the waypoint engine.
//!
//! Four enums cover the engine's failure surfaces:
//! - `EngineError`: run-level failures surfaced by the run controller
//! - `StoreError`: persistence and compare-and-swap failures
//! - `DefinitionError`: invalid run definitions, rejected before a run starts
//! - `WorkerError` (in `providers`): what an executor reports for one attempt

use crate::orchestrator::state::{PhaseEvent, PhaseState, RunStatus};
use crate::work_item::WorkItemStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the WorkItem, checkpoint, gate and decision stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conflict on work item {id}: expected status {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: WorkItemStatus,
        actual: WorkItemStatus,
    },

    #[error("Stale checkpoint for run {run_id}: expected seq {expected}, found {actual}")]
    StaleCheckpoint {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Work item {id} is {status} and can no longer change")]
    Immutable { id: String, status: WorkItemStatus },

    #[error("Invalid transition for work item {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: WorkItemStatus,
        to: WorkItemStatus,
    },

    #[error("Work item {id} would exceed its attempt budget ({attempts} > {max_attempts})")]
    AttemptsExceeded {
        id: String,
        attempts: u32,
        max_attempts: u32,
    },

    #[error("Run {run_id} is complete and can no longer change")]
    RunSealed { run_id: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid run id '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidRunId(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether this error signals benign contention with another writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::StaleCheckpoint { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serde(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serde {
            path: path.into(),
            source,
        }
    }
}

/// Errors found while validating a run definition.
#[derive(Debug, Error, PartialEq)]
pub enum DefinitionError {
    #[error("Run definition has no phases")]
    NoPhases,

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Duplicate work item id '{item}' (phase {phase})")]
    DuplicateItem { phase: String, item: String },

    #[error("Invalid id '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidId(String),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Phase dependencies form a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Phase {phase} references unknown gate {gate}")]
    UnknownGate { phase: String, gate: String },

    #[error("Gate {gate} is invalid: {message}")]
    InvalidGate { gate: String, message: String },

    #[error("Work item {item} must allow at least one attempt")]
    ZeroAttempts { item: String },
}

/// Errors from the run controller and the components it drives.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Transient worker error on {item_id}: {message}")]
    TransientWorker { item_id: String, message: String },

    #[error("Permanent worker error on {item_id}: {message}")]
    PermanentWorker { item_id: String, message: String },

    #[error("Gate '{gate_id}' failed for phase {phase_id}: total {total} below threshold {threshold}")]
    GateFailure {
        phase_id: String,
        gate_id: String,
        total: f64,
        threshold: f64,
    },

    #[error("Concurrent update conflict: {0}")]
    Conflict(#[source] StoreError),

    #[error("Budget exceeded: consumed {consumed} of {ceiling}")]
    BudgetExceeded { consumed: u64, ceiling: u64 },

    #[error("Rollback of phase {phase_id} failed at '{label}': {message}")]
    RollbackFailure {
        phase_id: String,
        label: String,
        message: String,
    },

    #[error("Phase state {from:?} does not accept {event:?}")]
    IllegalPhaseTransition { from: PhaseState, event: PhaseEvent },

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error("Run {0} already exists")]
    RunExists(String),

    #[error("Run {run_id} already finished with status {status}")]
    RunFinished { run_id: String, status: RunStatus },

    #[error("Decision {decision_id} not found in run {run_id}")]
    DecisionNotFound { run_id: String, decision_id: String },

    #[error("Decision {0} was already resolved")]
    DecisionResolved(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        if err.is_conflict() {
            EngineError::Conflict(err)
        } else {
            EngineError::Store(err)
        }
    }
}
