//! Interfaces to the engine's external collaborators.
//!
//! The engine never knows what a worker does or how a deployment platform
//! works. It talks to them only through these traits:
//! - `Executor` runs one work item attempt
//! - `DeploymentProvider` opens, previews, merges and health-checks changes
//! - `VerificationProvider` runs a behavioural scenario against an endpoint
//! - `RubricScorer` scores a phase's output against rubric dimensions

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::gates::RubricDimension;
use crate::phase::Phase;
use crate::rollback::{RollbackController, UndoFn};
use crate::work_item::WorkItem;

/// What an executor reports when an attempt does not succeed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorkerError {
    /// Worth retrying: the next attempt may succeed
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying will not help
    #[error("permanent: {0}")]
    Permanent(String),
    /// The attempt observed cancellation and stopped
    #[error("cancelled")]
    Cancelled,
}

/// Successful outcome of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub output: Value,
    /// Budget units the attempt consumed, when the executor meters cost
    #[serde(default)]
    pub cost: Option<u64>,
    /// Change to open on the deployment provider
    #[serde(default)]
    pub diff: Option<String>,
}

impl ExecutionResult {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = Some(diff.into());
        self
    }
}

/// Per-attempt context handed to the executor.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub phase_id: String,
    /// 1-based attempt number within the current retry round
    pub attempt: u32,
    cancel: CancellationToken,
    rollback: Arc<RollbackController>,
}

impl ExecutionContext {
    pub fn new(
        run_id: &str,
        phase_id: &str,
        attempt: u32,
        cancel: CancellationToken,
        rollback: Arc<RollbackController>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt,
            cancel,
            rollback,
        }
    }

    /// Cooperative cancellation checkpoint for long-running executors.
    pub fn checkpoint(&self) -> Result<(), WorkerError> {
        if self.cancel.is_cancelled() {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Register an undo action for an external effect this attempt produced.
    pub fn register_compensation(&self, label: &str, undo: UndoFn) {
        self.rollback
            .register_compensation(&self.phase_id, label, undo);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("phase_id", &self.phase_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// The worker: runs one attempt of a work item.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        item: &WorkItem,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, WorkerError>;
}

/// Reference to a change opened on a deployment provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeRef(pub String);

impl fmt::Display for ChangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

/// Source control, CI and deployment.
#[async_trait]
pub trait DeploymentProvider: Send + Sync {
    async fn open_change(&self, diff: &str) -> anyhow::Result<ChangeRef>;

    async fn get_preview_endpoint(&self, change: &ChangeRef) -> anyhow::Result<String>;

    /// Returns false when the provider refused the merge.
    async fn merge(&self, change: &ChangeRef) -> anyhow::Result<bool>;

    async fn query_health(&self, endpoint: &str) -> anyhow::Result<HealthStatus>;

    /// Abandon a change. Used by rollback compensations.
    async fn close_change(&self, _change: &ChangeRef) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    #[serde(default)]
    pub details: String,
}

/// Behavioural verification of a deployed endpoint.
#[async_trait]
pub trait VerificationProvider: Send + Sync {
    async fn verify(&self, endpoint: &str, scenario: &Value) -> anyhow::Result<VerificationResult>;
}

/// Everything a rubric scorer sees.
#[derive(Debug, Clone, Copy)]
pub struct RubricRequest<'a> {
    pub phase: &'a Phase,
    pub gate_id: &'a str,
    pub dimensions: &'a [RubricDimension],
    pub items: &'a [WorkItem],
    /// The gate's configured scorer command, if any
    pub scorer: Option<&'a str>,
}

/// Raw scores keyed by dimension name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RubricScores {
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub flagged_items: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

#[async_trait]
pub trait RubricScorer: Send + Sync {
    async fn score(&self, request: &RubricRequest<'_>) -> anyhow::Result<RubricScores>;
}
