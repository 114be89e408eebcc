//! Run checkpoint state and the per-phase state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dispatch::BudgetUnit;
use crate::errors::EngineError;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    AwaitingGate,
    Blocked,
    AwaitingExternalDecision,
    Complete,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Aborted)
    }

    /// Paused runs wait on something outside the engine before resuming.
    pub fn is_paused(self) -> bool {
        matches!(
            self,
            RunStatus::Blocked | RunStatus::AwaitingExternalDecision
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::AwaitingGate => "awaiting_gate",
            RunStatus::Blocked => "blocked",
            RunStatus::AwaitingExternalDecision => "awaiting_external_decision",
            RunStatus::Complete => "complete",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    BudgetExceeded,
    RetriesExhausted,
    RollbackFailed,
    OperatorAbort,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaltReason::BudgetExceeded => "budget exceeded",
            HaltReason::RetriesExhausted => "gate retries exhausted",
            HaltReason::RollbackFailed => "rollback failed",
            HaltReason::OperatorAbort => "aborted by operator",
        };
        f.write_str(s)
    }
}

/// Scheduler state of the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    NotStarted,
    Running,
    AwaitingGate,
    Advanced,
    Retrying,
    Blocked,
    AwaitingExternalDecision,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Work items created; dispatch begins
    Enter,
    /// Every item settled, the stop condition held, or the iteration bound hit
    WorkSettled,
    GatePassed,
    /// Gate failed with retry budget left
    GateFailed,
    /// Gate failed and the retry budget is spent
    RetriesExhausted,
    /// Decision record created
    Escalate,
    OperatorRetry,
    OperatorAdvance,
    /// Effects accepted; the next phase may start
    Finish,
}

impl PhaseState {
    pub fn next(self, event: PhaseEvent) -> Result<PhaseState, EngineError> {
        use PhaseEvent as E;
        use PhaseState as S;
        let next = match (self, event) {
            (S::NotStarted, E::Enter) | (S::Retrying, E::Enter) => S::Running,
            (S::Running, E::WorkSettled) => S::AwaitingGate,
            (S::AwaitingGate, E::GatePassed) => S::Advanced,
            (S::AwaitingGate, E::GateFailed) => S::Retrying,
            (S::AwaitingGate, E::RetriesExhausted) => S::Blocked,
            (S::Blocked, E::Escalate) => S::AwaitingExternalDecision,
            (S::AwaitingExternalDecision, E::OperatorRetry) => S::Retrying,
            (S::AwaitingExternalDecision, E::OperatorAdvance) => S::Advanced,
            (S::Advanced, E::Finish) => S::Complete,
            (from, event) => return Err(EngineError::IllegalPhaseTransition { from, event }),
        };
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Passed,
    GateFailed,
    Blocked,
    RolledBack,
    RollbackFailed,
    OperatorRetry,
    OperatorAdvance,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase_id: String,
    pub outcome: PhaseOutcome,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The checkpoint: everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub definition_name: String,
    pub current_phase_id: Option<String>,
    #[serde(default)]
    pub phase_state: PhaseState,
    /// Gate retries used by the current phase
    #[serde(default)]
    pub phase_attempt: u32,
    #[serde(default)]
    pub phase_history: Vec<PhaseHistoryEntry>,
    #[serde(default)]
    pub completed_phases: Vec<String>,
    /// Current phase items not yet settled, as of this checkpoint
    #[serde(default)]
    pub pending_work_items: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    /// Monotonic
    #[serde(default)]
    pub budget_consumed: u64,
    #[serde(default)]
    pub budget_ceiling: Option<u64>,
    #[serde(default)]
    pub budget_unit: BudgetUnit,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_decision: Option<String>,
    /// Write sequence used for compare-and-swap
    #[serde(default)]
    pub seq: u64,
}

impl RunState {
    pub fn new(run_id: &str, definition_name: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            definition_name: definition_name.to_string(),
            current_phase_id: None,
            phase_state: PhaseState::NotStarted,
            phase_attempt: 0,
            phase_history: Vec::new(),
            completed_phases: Vec::new(),
            pending_work_items: Vec::new(),
            started_at: now,
            last_checkpoint_at: now,
            budget_consumed: 0,
            budget_ceiling: None,
            budget_unit: BudgetUnit::default(),
            status: RunStatus::Running,
            halt_reason: None,
            pending_decision: None,
            seq: 0,
        }
    }

    pub fn with_budget(mut self, ceiling: Option<u64>, unit: BudgetUnit) -> Self {
        self.budget_ceiling = ceiling;
        self.budget_unit = unit;
        self
    }

    /// Apply a phase event to the current phase.
    pub fn transition(&mut self, event: PhaseEvent) -> Result<(), EngineError> {
        self.phase_state = self.phase_state.next(event)?;
        Ok(())
    }

    pub fn record(&mut self, phase_id: &str, outcome: PhaseOutcome, detail: Option<String>) {
        self.phase_history.push(PhaseHistoryEntry {
            phase_id: phase_id.to_string(),
            outcome,
            attempt: self.phase_attempt,
            timestamp: Utc::now(),
            detail,
        });
    }

    /// Mark the current phase complete and clear it.
    pub fn complete_phase(&mut self) {
        if let Some(id) = self.current_phase_id.take()
            && !self.completed_phases.contains(&id)
        {
            self.completed_phases.push(id);
        }
        self.phase_state = PhaseState::NotStarted;
        self.phase_attempt = 0;
        self.pending_work_items.clear();
    }

    pub fn halt(&mut self, status: RunStatus, reason: HaltReason) {
        self.status = status;
        self.halt_reason = Some(reason);
    }

    pub fn budget_exhausted(&self) -> bool {
        self.budget_ceiling
            .is_some_and(|ceiling| self.budget_consumed >= ceiling)
    }

    pub fn budget_halted(&self) -> bool {
        self.status == RunStatus::Blocked && self.halt_reason == Some(HaltReason::BudgetExceeded)
    }

    /// Process exit code for this state.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Complete => 0,
            RunStatus::Aborted => 2,
            _ if self.budget_halted() => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = PhaseState::NotStarted;
        for event in [
            PhaseEvent::Enter,
            PhaseEvent::WorkSettled,
            PhaseEvent::GatePassed,
            PhaseEvent::Finish,
        ] {
            state = state.next(event).unwrap();
        }
        assert_eq!(state, PhaseState::Complete);
    }

    #[test]
    fn test_retry_and_escalation_path() {
        let state = PhaseState::AwaitingGate
            .next(PhaseEvent::GateFailed)
            .unwrap();
        assert_eq!(state, PhaseState::Retrying);
        assert_eq!(state.next(PhaseEvent::Enter).unwrap(), PhaseState::Running);

        let blocked = PhaseState::AwaitingGate
            .next(PhaseEvent::RetriesExhausted)
            .unwrap();
        let waiting = blocked.next(PhaseEvent::Escalate).unwrap();
        assert_eq!(waiting, PhaseState::AwaitingExternalDecision);
        assert_eq!(
            waiting.next(PhaseEvent::OperatorAdvance).unwrap(),
            PhaseState::Advanced
        );
        assert_eq!(
            waiting.next(PhaseEvent::OperatorRetry).unwrap(),
            PhaseState::Retrying
        );
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let err = PhaseState::Running
            .next(PhaseEvent::GatePassed)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::IllegalPhaseTransition {
                from: PhaseState::Running,
                event: PhaseEvent::GatePassed
            }
        ));
    }

    #[test]
    fn test_exit_codes() {
        let mut state = RunState::new("r1", "demo");
        assert_eq!(state.exit_code(), 1);
        state.halt(RunStatus::Blocked, HaltReason::BudgetExceeded);
        assert_eq!(state.exit_code(), 3);
        state.halt(RunStatus::AwaitingExternalDecision, HaltReason::RetriesExhausted);
        assert_eq!(state.exit_code(), 1);
        state.status = RunStatus::Aborted;
        assert_eq!(state.exit_code(), 2);
        state.status = RunStatus::Complete;
        assert_eq!(state.exit_code(), 0);
    }

    #[test]
    fn test_complete_phase_is_idempotent() {
        let mut state = RunState::new("r1", "demo");
        state.current_phase_id = Some("build".into());
        state.phase_attempt = 2;
        state.complete_phase();
        state.current_phase_id = Some("build".into());
        state.complete_phase();
        assert_eq!(state.completed_phases, vec!["build"]);
        assert_eq!(state.phase_attempt, 0);
        assert!(state.current_phase_id.is_none());
    }

    #[test]
    fn test_budget_exhausted() {
        let mut state = RunState::new("r1", "demo").with_budget(Some(100), BudgetUnit::Cost);
        state.budget_consumed = 99;
        assert!(!state.budget_exhausted());
        state.budget_consumed = 100;
        assert!(state.budget_exhausted());
        assert!(!RunState::new("r2", "demo").budget_exhausted());
    }
}
