//! Phase definitions and run definition loading.
//!
//! This module provides:
//! - `Phase`, the ordered stage of a run with its own work set and gate
//! - `WorkItemSpec`, the declaration a phase turns into work items on entry
//! - `RunDefinition`, the full JSON document a run is started from
//! - Validation of ids, gates and the phase dependency graph

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::dag::DagBuilder;
use crate::errors::DefinitionError;
use crate::gates::{DEFAULT_GATE_ID, GateDefinition};
use crate::work_item::{WorkItem, WorkItemStatus};

/// How a phase's work items are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseMode {
    /// One item at a time, in priority order
    #[default]
    Sequential,
    /// Up to the engine's concurrency limit at once
    Parallel,
}

/// Work-based predicate that ends a phase's dispatch early.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopCondition {
    /// Every item is settled (default)
    #[default]
    AllSettled,
    /// At least `count` items succeeded
    MinSucceeded { count: usize },
    /// Any item failed or blocked
    AnyFailed,
}

impl StopCondition {
    pub fn is_met(&self, items: &[WorkItem]) -> bool {
        match self {
            StopCondition::AllSettled => items.iter().all(|i| i.status.is_settled()),
            StopCondition::MinSucceeded { count } => {
                items
                    .iter()
                    .filter(|i| i.status == WorkItemStatus::Succeeded)
                    .count()
                    >= *count
            }
            StopCondition::AnyFailed => items
                .iter()
                .any(|i| matches!(i.status, WorkItemStatus::Failed | WorkItemStatus::Blocked)),
        }
    }
}

/// Declaration of a work item, instantiated when its phase is entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemSpec {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_kind() -> String {
    "task".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

impl WorkItemSpec {
    pub fn new(id: &str, payload: Value) -> Self {
        Self {
            id: id.to_string(),
            kind: default_kind(),
            payload,
            priority: 0,
            max_attempts: default_max_attempts(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Instantiate the work item for `phase_id` at declaration position `sequence`.
    pub fn instantiate(&self, phase_id: &str, sequence: u64) -> WorkItem {
        WorkItem::new(
            &self.id,
            phase_id,
            &self.kind,
            self.payload.clone(),
            self.priority,
            sequence,
            self.max_attempts,
        )
    }
}

/// An ordered stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    /// Default sequencing position
    pub ordinal: u32,
    #[serde(default)]
    pub mode: PhaseMode,
    /// Gate definition id; the built-in all-items-succeeded gate when absent
    #[serde(default)]
    pub gate: Option<String>,
    #[serde(default)]
    pub stop_condition: StopCondition,
    /// Fallback bound on dispatch attempts per phase entry
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Gate retries before the phase blocks
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Explicit dependency edges overriding ordinal order
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Let a phase with no work pass its gate
    #[serde(default)]
    pub empty_is_success: bool,
    #[serde(default = "default_true")]
    pub rollback_on_block: bool,
    /// Merge every change the phase opened once the gate passes
    #[serde(default)]
    pub merge_on_pass: bool,
    #[serde(default)]
    pub items: Vec<WorkItemSpec>,
}

fn default_max_iterations() -> u32 {
    100
}

fn default_max_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

impl Phase {
    pub fn new(id: &str, name: &str, ordinal: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ordinal,
            mode: PhaseMode::default(),
            gate: None,
            stop_condition: StopCondition::default(),
            max_iterations: default_max_iterations(),
            max_retries: default_max_retries(),
            depends_on: Vec::new(),
            empty_is_success: false,
            rollback_on_block: true,
            merge_on_pass: false,
            items: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: PhaseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_gate(mut self, gate: &str) -> Self {
        self.gate = Some(gate.to_string());
        self
    }

    pub fn with_items(mut self, items: Vec<WorkItemSpec>) -> Self {
        self.items = items;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn gate_id(&self) -> &str {
        self.gate.as_deref().unwrap_or(DEFAULT_GATE_ID)
    }
}

/// The JSON document a run is started from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDefinition {
    pub name: String,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub gates: BTreeMap<String, GateDefinition>,
}

impl RunDefinition {
    pub fn new(name: &str, phases: Vec<Phase>) -> Self {
        Self {
            name: name.to_string(),
            phases,
            gates: BTreeMap::new(),
        }
    }

    pub fn with_gate(mut self, id: &str, gate: GateDefinition) -> Self {
        self.gates.insert(id.to_string(), gate);
        self
    }

    /// Load and validate a definition from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run definition {}", path.display()))?;
        let definition: RunDefinition = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run definition {}", path.display()))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// The gate that guards `phase`.
    pub fn gate_for(&self, phase: &Phase) -> Option<GateDefinition> {
        match phase.gate.as_deref() {
            Some(id) => self.gates.get(id).cloned(),
            None => Some(GateDefinition::default_gate()),
        }
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.phases.is_empty() {
            return Err(DefinitionError::NoPhases);
        }

        let mut phase_ids = HashSet::new();
        let mut item_ids = HashSet::new();
        for phase in &self.phases {
            validate_id(&phase.id)?;
            if !phase_ids.insert(phase.id.as_str()) {
                return Err(DefinitionError::DuplicatePhase(phase.id.clone()));
            }
            if let Some(gate) = phase.gate.as_deref()
                && !self.gates.contains_key(gate)
            {
                return Err(DefinitionError::UnknownGate {
                    phase: phase.id.clone(),
                    gate: gate.to_string(),
                });
            }
            for item in &phase.items {
                validate_id(&item.id)?;
                if item.max_attempts == 0 {
                    return Err(DefinitionError::ZeroAttempts {
                        item: item.id.clone(),
                    });
                }
                if !item_ids.insert(item.id.as_str()) {
                    return Err(DefinitionError::DuplicateItem {
                        phase: phase.id.clone(),
                        item: item.id.clone(),
                    });
                }
            }
        }

        for (id, gate) in &self.gates {
            gate.validate(id)?;
        }

        DagBuilder::new(self.phases.clone()).build()?;
        Ok(())
    }
}

/// Ids become file names in the file store, so keep them path-safe.
pub fn validate_id(id: &str) -> Result<(), DefinitionError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DefinitionError::InvalidId(id.to_string()))
    }
}
