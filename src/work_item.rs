//! Work items: the discrete, dispatchable units of work inside a phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle status of a work item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting to be dispatched
    #[default]
    Pending,
    /// Claimed by a dispatcher and running on a worker
    Dispatched,
    /// Completed successfully (immutable)
    Succeeded,
    /// Last attempt failed; may be re-queued
    Failed,
    /// Out of attempts; needs a phase retry or an operator decision
    Blocked,
    /// Stopped by an operator abort (immutable)
    Cancelled,
}

impl WorkItemStatus {
    /// Succeeded and Cancelled items never change again.
    pub fn is_immutable(self) -> bool {
        matches!(self, Self::Succeeded | Self::Cancelled)
    }

    /// Whether the item needs no further dispatch in the current round.
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Pending | Self::Dispatched)
    }

    /// Whether moving from `self` to `to` is a legal lifecycle step.
    pub fn can_transition_to(self, to: WorkItemStatus) -> bool {
        use WorkItemStatus::*;
        matches!(
            (self, to),
            (Pending, Dispatched)
                | (Pending, Cancelled)
                | (Dispatched, Succeeded)
                | (Dispatched, Failed)
                | (Dispatched, Cancelled)
                | (Dispatched, Pending)
                | (Dispatched, Blocked)
                | (Failed, Pending)
                | (Failed, Blocked)
                | (Blocked, Pending)
                | (Blocked, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    Timeout,
    Transient,
    Permanent,
    Cancelled,
    /// The process driving the attempt went away before it reported back.
    Interrupted,
}

impl ItemErrorKind {
    /// Retryable kinds are absorbed up to the item's attempt budget.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Transient | Self::Interrupted)
    }
}

/// The error recorded on a work item by its most recent failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ItemErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Lift into the engine taxonomy for reporting.
    pub fn to_engine_error(&self, item_id: &str) -> crate::errors::EngineError {
        use crate::errors::EngineError;
        if self.kind.is_retryable() {
            EngineError::TransientWorker {
                item_id: item_id.to_string(),
                message: self.message.clone(),
            }
        } else {
            EngineError::PermanentWorker {
                item_id: item_id.to_string(),
                message: self.message.clone(),
            }
        }
    }
}

/// A dispatchable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique id, stable across resume
    pub id: String,
    pub phase_id: String,
    /// Free-form tag
    pub kind: String,
    /// Opaque payload handed to the executor
    #[serde(default)]
    pub payload: Value,
    /// Priority tier; lower value runs first
    pub priority: u32,
    /// Creation order within the phase, used as the FIFO tiebreak
    pub sequence: u64,
    pub status: WorkItemStatus,
    /// Attempts used in the current retry round
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Attempts across all rounds, never reset
    #[serde(default)]
    pub total_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ItemError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Change opened on the deployment provider for this item's result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_ref: Option<String>,
    /// Gate notes handed to a revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Id of the item this one supersedes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revises: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(
        id: &str,
        phase_id: &str,
        kind: &str,
        payload: Value,
        priority: u32,
        sequence: u64,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            phase_id: phase_id.to_string(),
            kind: kind.to_string(),
            payload,
            priority,
            sequence,
            status: WorkItemStatus::Pending,
            attempt_count: 0,
            max_attempts,
            total_attempts: 0,
            last_error: None,
            output: None,
            change_ref: None,
            feedback: None,
            revises: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Total dispatch order key: priority tier, then creation order.
    pub fn order_key(&self) -> (u32, u64) {
        (self.priority, self.sequence)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Build the revision that supersedes this item after a gate flagged it.
    pub fn revision(&self, revision_no: u32, sequence: u64, feedback: Option<String>) -> Self {
        let root = self.revises.as_deref().unwrap_or(&self.id);
        let root = root.split("~r").next().unwrap_or(root);
        let mut next = WorkItem::new(
            &format!("{}~r{}", root, revision_no),
            &self.phase_id,
            &self.kind,
            self.payload.clone(),
            self.priority,
            sequence,
            self.max_attempts,
        );
        next.revises = Some(self.id.clone());
        next.feedback = feedback;
        next
    }
}

/// Sort items into dispatch order.
pub fn sort_by_dispatch_order(items: &mut [WorkItem]) {
    items.sort_by(|a, b| a.order_key().cmp(&b.order_key()).then_with(|| a.id.cmp(&b.id)));
}

/// Drop items that a later revision supersedes.
pub fn effective_items(items: &[WorkItem]) -> Vec<WorkItem> {
    let superseded: std::collections::HashSet<&str> =
        items.iter().filter_map(|i| i.revises.as_deref()).collect();
    items
        .iter()
        .filter(|i| !superseded.contains(i.id.as_str()))
        .cloned()
        .collect()
}
