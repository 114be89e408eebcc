//! Dispatcher audit log: one record per work item attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    Timeout,
    TransientError,
    PermanentError,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Ok => "ok",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::TransientError => "transient_error",
            AttemptOutcome::PermanentError => "permanent_error",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub item_id: String,
    pub phase_id: String,
    /// Attempt number within the item's current retry round
    pub attempt_count: u32,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(
        item_id: &str,
        phase_id: &str,
        attempt_count: u32,
        outcome: AttemptOutcome,
        duration_ms: u64,
    ) -> Self {
        Self {
            item_id: item_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt_count,
            outcome,
            duration_ms,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Compact `item:outcome` form, e.g. `build:timeout`.
    pub fn summary(&self) -> String {
        format!("{}:{}", self.item_id, self.outcome)
    }
}

/// Summaries of `records` in log order.
pub fn summarize(records: &[AttemptRecord]) -> Vec<String> {
    records.iter().map(AttemptRecord::summary).collect()
}
