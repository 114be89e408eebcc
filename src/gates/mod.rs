//! Phase gates: the checks a phase must pass before the run advances.
//!
//! Two strategies are supported:
//! - **Deterministic**: a boolean AND of named checks. Any failing check
//!   yields `passed = false` and `total = 0`.
//! - **Rubric**: independently scored, weighted dimensions summed against a
//!   threshold. Dimensions and weights are data, so new phases define new
//!   rubrics without engine changes.

mod evaluator;

pub use evaluator::GateEvaluator;

use crate::errors::DefinitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Id of the gate used by phases that do not name one.
pub const DEFAULT_GATE_ID: &str = "all_items_succeeded";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateDefinition {
    Deterministic {
        #[serde(default)]
        checks: Vec<CheckSpec>,
    },
    Rubric {
        dimensions: Vec<RubricDimension>,
        threshold: f64,
        /// Scorer command handed to the rubric scorer
        #[serde(default)]
        scorer: Option<String>,
    },
}

impl GateDefinition {
    /// Built-in gate: every effective work item succeeded.
    pub fn default_gate() -> Self {
        GateDefinition::Deterministic {
            checks: vec![CheckSpec::new(
                "all items succeeded",
                Check::AllItemsSucceeded,
            )],
        }
    }

    pub fn validate(&self, id: &str) -> Result<(), DefinitionError> {
        let invalid = |message: &str| DefinitionError::InvalidGate {
            gate: id.to_string(),
            message: message.to_string(),
        };
        match self {
            GateDefinition::Deterministic { checks } => {
                let mut names = HashSet::new();
                for check in checks {
                    if !names.insert(check.name.as_str()) {
                        return Err(invalid(&format!("duplicate check name '{}'", check.name)));
                    }
                }
            }
            GateDefinition::Rubric {
                dimensions,
                threshold,
                ..
            } => {
                if dimensions.is_empty() {
                    return Err(invalid("rubric needs at least one dimension"));
                }
                if !threshold.is_finite() {
                    return Err(invalid("threshold must be a finite number"));
                }
                let mut names = HashSet::new();
                for dim in dimensions {
                    if !names.insert(dim.name.as_str()) {
                        return Err(invalid(&format!("duplicate dimension '{}'", dim.name)));
                    }
                    if !(dim.weight.is_finite() && dim.weight > 0.0) {
                        return Err(invalid(&format!(
                            "dimension '{}' needs a positive weight",
                            dim.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A named deterministic check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    #[serde(flatten)]
    pub check: Check,
}

impl CheckSpec {
    pub fn new(name: &str, check: Check) -> Self {
        Self {
            name: name.to_string(),
            check,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Check {
    /// Every effective work item is Succeeded
    AllItemsSucceeded,
    /// Shell command exits 0
    Command { command: String },
    /// Deployment provider reports the endpoint healthy
    Health { endpoint: String },
    /// Every change opened by the phase has a healthy preview
    PreviewHealth,
    /// Verification provider passes the scenario against the endpoint
    Verify {
        endpoint: String,
        #[serde(default)]
        scenario: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricDimension {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_weight() -> f64 {
    1.0
}

impl RubricDimension {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            weight: default_weight(),
            description: String::new(),
        }
    }

    pub fn weighted(name: &str, weight: f64) -> Self {
        Self {
            weight,
            ..Self::new(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub dimension: String,
    pub score: f64,
    pub weight: f64,
}

/// Outcome of one gate evaluation. Append-only: never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub phase_id: String,
    /// Phase attempt this evaluation belongs to (0 = first entry)
    pub attempt: u32,
    /// Scores in rubric / check declaration order
    pub dimension_scores: Vec<DimensionScore>,
    pub total: f64,
    pub threshold: f64,
    /// `total >= threshold`, unless exhausted work items vetoed the gate
    pub passed: bool,
    #[serde(default)]
    pub notes: String,
    /// Work items the gate attributes the failure to
    #[serde(default)]
    pub flagged_items: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl GateResult {
    /// Weighted-sum result; `passed` is `total >= threshold`.
    pub fn scored(
        gate_id: &str,
        phase_id: &str,
        attempt: u32,
        dimension_scores: Vec<DimensionScore>,
        threshold: f64,
        notes: String,
        flagged_items: Vec<String>,
    ) -> Self {
        let total = dimension_scores.iter().map(|d| d.score * d.weight).sum();
        Self::build(
            gate_id,
            phase_id,
            attempt,
            dimension_scores,
            total,
            threshold,
            notes,
            flagged_items,
        )
    }

    /// AND of named checks: each passing check scores 1, any failure zeroes the total.
    pub fn deterministic(
        gate_id: &str,
        phase_id: &str,
        attempt: u32,
        checks: Vec<(String, bool)>,
        notes: String,
        flagged_items: Vec<String>,
    ) -> Self {
        let all_passed = checks.iter().all(|(_, ok)| *ok);
        let threshold = checks.len() as f64;
        let dimension_scores: Vec<DimensionScore> = checks
            .into_iter()
            .map(|(name, ok)| DimensionScore {
                dimension: name,
                score: if ok { 1.0 } else { 0.0 },
                weight: 1.0,
            })
            .collect();
        let total = if all_passed { threshold } else { 0.0 };
        // An empty check list is vacuously true.
        let threshold = if all_passed { threshold } else { threshold.max(1.0) };
        Self::build(
            gate_id,
            phase_id,
            attempt,
            dimension_scores,
            total,
            threshold,
            notes,
            flagged_items,
        )
    }

    /// Result for a phase that produced no work items.
    pub fn empty(gate_id: &str, phase_id: &str, attempt: u32, empty_is_success: bool) -> Self {
        let (threshold, notes) = if empty_is_success {
            (0.0, "phase produced no work; empty phase accepted")
        } else {
            (1.0, "phase produced no work")
        };
        Self::build(
            gate_id,
            phase_id,
            attempt,
            Vec::new(),
            0.0,
            threshold,
            notes.to_string(),
            Vec::new(),
        )
    }

    /// Fail the gate on items that ran out of attempts, whatever the score.
    pub fn veto(&mut self, exhausted: Vec<String>) {
        if exhausted.is_empty() {
            return;
        }
        let note = format!("not succeeded: {}", exhausted.join(", "));
        self.notes = if self.notes.is_empty() {
            note
        } else {
            format!("{}; {}", self.notes, note)
        };
        for id in exhausted {
            if !self.flagged_items.contains(&id) {
                self.flagged_items.push(id);
            }
        }
        self.passed = false;
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        gate_id: &str,
        phase_id: &str,
        attempt: u32,
        dimension_scores: Vec<DimensionScore>,
        total: f64,
        threshold: f64,
        notes: String,
        flagged_items: Vec<String>,
    ) -> Self {
        Self {
            gate_id: gate_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt,
            dimension_scores,
            total,
            threshold,
            passed: total >= threshold,
            notes,
            flagged_items,
            evaluated_at: Utc::now(),
        }
    }
}
