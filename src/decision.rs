//! External decision records.
//!
//! When a phase blocks, the run pauses on a decision record until an
//! operator resolves it with one of the offered choices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionChoice {
    /// Start a fresh retry round for the blocked phase
    Retry,
    /// Accept the phase as-is and move on
    Advance,
    /// End the run
    Abort,
}

impl DecisionChoice {
    pub const ALL: [DecisionChoice; 3] = [
        DecisionChoice::Retry,
        DecisionChoice::Advance,
        DecisionChoice::Abort,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionChoice::Retry => "retry",
            DecisionChoice::Advance => "advance",
            DecisionChoice::Abort => "abort",
        }
    }
}

impl fmt::Display for DecisionChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(DecisionChoice::Retry),
            "advance" => Ok(DecisionChoice::Advance),
            "abort" => Ok(DecisionChoice::Abort),
            other => Err(format!(
                "unknown decision '{}': expected retry, advance or abort",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResolution {
    pub choice: DecisionChoice,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub run_id: String,
    pub phase_id: String,
    pub reason: String,
    pub options: Vec<DecisionChoice>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<DecisionResolution>,
}

impl DecisionRecord {
    /// `ordinal` is the 1-based count of decisions raised for the phase.
    pub fn new(run_id: &str, phase_id: &str, ordinal: usize, reason: impl Into<String>) -> Self {
        Self {
            id: format!("{}-d{}", phase_id, ordinal),
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            reason: reason.into(),
            options: DecisionChoice::ALL.to_vec(),
            created_at: Utc::now(),
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn choice(&self) -> Option<DecisionChoice> {
        self.resolution.as_ref().map(|r| r.choice)
    }

    pub fn resolve(&mut self, choice: DecisionChoice) {
        self.resolution = Some(DecisionResolution {
            choice,
            resolved_at: Utc::now(),
        });
    }
}
