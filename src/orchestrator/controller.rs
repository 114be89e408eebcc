//! The run controller: drives a run from its checkpoint to the next pause.
//!
//! One controller drives a run at a time. It is the only writer of the
//! checkpoint, which it saves after every phase transition and on the
//! dispatcher's periodic tick. Anything else that wants to change the run
//! (an operator abort or decision) goes through the store and is picked up by
//! the controller.
//!
//! Per step the controller:
//! - picks the next phase in dependency order and creates its work items
//! - dispatches the phase's pending items
//! - evaluates the phase gate against the stored items
//! - advances, retries a narrowed work set, or blocks and escalates

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::scheduler::{PhaseScheduler, RetryPlan, unsettled_items};
use super::state::{HaltReason, PhaseEvent, PhaseOutcome, PhaseState, RunState, RunStatus};
use crate::decision::{DecisionChoice, DecisionRecord};
use crate::dispatch::{BudgetMeter, BudgetUnit, DispatchConfig, DispatchHalt, Dispatcher};
use crate::errors::{DefinitionError, EngineError, StoreError};
use crate::gates::{GateEvaluator, GateResult};
use crate::phase::{Phase, RunDefinition};
use crate::providers::{ChangeRef, DeploymentProvider, Executor};
use crate::rollback::RollbackController;
use crate::store::RunStore;
use crate::work_item::{WorkItem, WorkItemStatus, effective_items};

/// Engine knobs for one controller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dispatch: DispatchConfig,
    /// Budget ceiling for a new run. On resume it can only raise the stored ceiling.
    pub budget_ceiling: Option<u64>,
    pub budget_unit: BudgetUnit,
    /// Stay in-process and wait when a phase escalates to a decision
    pub wait_for_decisions: bool,
}

/// Progress notifications for a UI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    PhaseEntered {
        phase: String,
        attempt: u32,
        created: usize,
    },
    PhaseDispatched {
        phase: String,
        attempts: usize,
        succeeded: usize,
    },
    GateEvaluated {
        phase: String,
        gate: String,
        total: f64,
        threshold: f64,
        passed: bool,
    },
    PhaseRetrying {
        phase: String,
        attempt: u32,
        requeued: Vec<String>,
        revised: Vec<String>,
    },
    PhaseAdvanced {
        phase: String,
        overridden: bool,
    },
    PhaseBlocked {
        phase: String,
        reason: String,
    },
    DecisionRequired {
        phase: String,
        decision_id: String,
    },
    RunHalted {
        status: RunStatus,
        reason: Option<HaltReason>,
    },
    RunCompleted,
}

/// Snapshot of a run for `status` and the end of `start`/`resume`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub definition_name: String,
    pub status: RunStatus,
    pub halt_reason: Option<HaltReason>,
    pub current_phase_id: Option<String>,
    pub phase_state: PhaseState,
    pub phase_attempt: u32,
    pub completed_phases: Vec<String>,
    pub budget_consumed: u64,
    pub budget_ceiling: Option<u64>,
    pub budget_unit: BudgetUnit,
    pub pending_decision: Option<DecisionRecord>,
    /// Item counts by status across the whole run
    pub items: BTreeMap<WorkItemStatus, usize>,
    pub exit_code: u8,
}

impl RunReport {
    pub fn from_state(store: &dyn RunStore, state: &RunState) -> Result<Self, EngineError> {
        let mut items = BTreeMap::new();
        for item in effective_items(&store.list_all()?) {
            *items.entry(item.status).or_insert(0) += 1;
        }
        let pending_decision = match &state.pending_decision {
            Some(id) => store.get_decision(id)?,
            None => None,
        };
        Ok(Self {
            run_id: state.run_id.clone(),
            definition_name: state.definition_name.clone(),
            status: state.status,
            halt_reason: state.halt_reason,
            current_phase_id: state.current_phase_id.clone(),
            phase_state: state.phase_state,
            phase_attempt: state.phase_attempt,
            completed_phases: state.completed_phases.clone(),
            budget_consumed: state.budget_consumed,
            budget_ceiling: state.budget_ceiling,
            budget_unit: state.budget_unit,
            pending_decision,
            items,
            exit_code: state.exit_code(),
        })
    }
}

fn load_state(store: &dyn RunStore) -> Result<RunState, EngineError> {
    store
        .load_checkpoint()?
        .ok_or_else(|| EngineError::RunNotFound(store.run_id().to_string()))
}

/// Save the checkpoint if nobody else wrote one since we last did.
fn persist(store: &dyn RunStore, state: &mut RunState) -> Result<(), EngineError> {
    *state = store.save_checkpoint(state, state.seq)?;
    Ok(())
}

/// Current status of the run in `store`.
pub fn run_status(store: &dyn RunStore) -> Result<RunReport, EngineError> {
    let state = load_state(store)?;
    RunReport::from_state(store, &state)
}

/// Record an operator's choice on a pending decision.
pub fn resolve_decision(
    store: &dyn RunStore,
    decision_id: &str,
    choice: DecisionChoice,
) -> Result<DecisionRecord, EngineError> {
    let state = load_state(store)?;
    if state.status.is_terminal() {
        return Err(EngineError::RunFinished {
            run_id: state.run_id,
            status: state.status,
        });
    }
    let mut decision =
        store
            .get_decision(decision_id)?
            .ok_or_else(|| EngineError::DecisionNotFound {
                run_id: state.run_id.clone(),
                decision_id: decision_id.to_string(),
            })?;
    if decision.is_resolved() {
        return Err(EngineError::DecisionResolved(decision.id));
    }
    decision.resolve(choice);
    store.put_decision(&decision)?;
    info!(run_id = %state.run_id, decision = %decision.id, %choice, "decision resolved");
    Ok(decision)
}

/// Request an abort.
///
/// A run that is driving picks the request up at its next tick. A paused run
/// has no driver, so it is finalized here.
pub fn abort_run(store: &dyn RunStore) -> Result<RunReport, EngineError> {
    let mut state = load_state(store)?;
    if state.status.is_terminal() {
        return Err(EngineError::RunFinished {
            run_id: state.run_id,
            status: state.status,
        });
    }
    store.request_abort()?;
    if state.status.is_paused() {
        finalize_abort(store, &mut state)?;
    } else {
        info!(run_id = %state.run_id, "abort requested; the driving process will stop at its next tick");
    }
    RunReport::from_state(store, &state)
}

/// Cancel the current phase's outstanding items and mark the run aborted.
fn finalize_abort(store: &dyn RunStore, state: &mut RunState) -> Result<(), EngineError> {
    if let Some(phase_id) = state.current_phase_id.clone() {
        for item in store.list_by_phase(&phase_id, None)? {
            if !matches!(item.status, WorkItemStatus::Pending | WorkItemStatus::Blocked) {
                continue;
            }
            match store.update_status(&item.id, item.status, WorkItemStatus::Cancelled) {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    warn!(item = %item.id, error = %e, "item changed during abort")
                }
                Err(e) => return Err(e.into()),
            }
        }
        state.record(&phase_id, PhaseOutcome::Aborted, None);
    }
    if let Some(id) = state.pending_decision.take()
        && let Some(mut decision) = store.get_decision(&id)?
        && !decision.is_resolved()
    {
        decision.resolve(DecisionChoice::Abort);
        store.put_decision(&decision)?;
    }
    state.halt(RunStatus::Aborted, HaltReason::OperatorAbort);
    state.pending_work_items.clear();
    persist(store, state)?;
    warn!(run_id = %state.run_id, "run aborted");
    Ok(())
}

/// In-process control of a driving controller.
#[derive(Clone)]
pub struct RunHandle {
    store: Arc<dyn RunStore>,
    cancel: CancellationToken,
    decisions: Arc<Notify>,
}

impl RunHandle {
    /// Cancel in-flight work and stop the run.
    pub fn abort(&self) -> Result<(), EngineError> {
        self.store.request_abort()?;
        self.cancel.cancel();
        Ok(())
    }

    /// Resolve a decision and wake a controller waiting on it.
    pub fn decide(
        &self,
        decision_id: &str,
        choice: DecisionChoice,
    ) -> Result<DecisionRecord, EngineError> {
        let decision = resolve_decision(self.store.as_ref(), decision_id, choice)?;
        self.decisions.notify_one();
        Ok(decision)
    }
}

pub struct RunController {
    store: Arc<dyn RunStore>,
    definition: RunDefinition,
    scheduler: PhaseScheduler,
    executor: Arc<dyn Executor>,
    deployment: Option<Arc<dyn DeploymentProvider>>,
    gates: GateEvaluator,
    rollback: Arc<RollbackController>,
    cancel: CancellationToken,
    decisions: Arc<Notify>,
    options: RunOptions,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl RunController {
    pub fn new(
        store: Arc<dyn RunStore>,
        definition: RunDefinition,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, EngineError> {
        definition.validate()?;
        let scheduler = PhaseScheduler::new(&definition)?;
        Ok(Self {
            store,
            definition,
            scheduler,
            executor,
            deployment: None,
            gates: GateEvaluator::new(),
            rollback: Arc::new(RollbackController::new()),
            cancel: CancellationToken::new(),
            decisions: Arc::new(Notify::new()),
            options: RunOptions::default(),
            events: None,
        })
    }

    /// Controller for an existing run, using the definition snapshot it was started with.
    pub fn for_existing_run(
        store: Arc<dyn RunStore>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, EngineError> {
        let definition = store.load_definition()?.ok_or_else(|| StoreError::NotFound {
            kind: "Run definition",
            id: store.run_id().to_string(),
        })?;
        Self::new(store, definition, executor)
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces any deployment provider the gate evaluator was given.
    pub fn with_deployment(mut self, deployment: Option<Arc<dyn DeploymentProvider>>) -> Self {
        self.gates = self.gates.with_deployment(deployment.clone());
        self.deployment = deployment;
        self
    }

    pub fn with_gate_evaluator(mut self, gates: GateEvaluator) -> Self {
        self.gates = gates.with_deployment(self.deployment.clone());
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn run_id(&self) -> &str {
        self.store.run_id()
    }

    pub fn handle(&self) -> RunHandle {
        RunHandle {
            store: self.store.clone(),
            cancel: self.cancel.clone(),
            decisions: self.decisions.clone(),
        }
    }

    pub fn status(&self) -> Result<RunReport, EngineError> {
        run_status(self.store.as_ref())
    }

    /// Start a new run and drive it until it completes or pauses.
    pub async fn start(&self) -> Result<RunReport, EngineError> {
        if self.store.load_checkpoint()?.is_some() {
            return Err(EngineError::RunExists(self.run_id().to_string()));
        }
        self.store.save_definition(&self.definition)?;
        let mut state = RunState::new(self.run_id(), &self.definition.name)
            .with_budget(self.options.budget_ceiling, self.options.budget_unit);
        persist(self.store.as_ref(), &mut state)?;
        info!(
            run_id = %state.run_id,
            definition = %self.definition.name,
            phases = self.definition.phases.len(),
            "run started"
        );
        self.drive(state).await
    }

    /// Resume from the latest checkpoint.
    ///
    /// Work item status wins over the checkpoint: succeeded items are never
    /// dispatched again, and attempts interrupted mid-flight are settled first.
    pub async fn resume(&self) -> Result<RunReport, EngineError> {
        let mut state = load_state(self.store.as_ref())?;
        if state.status.is_terminal() {
            return Err(EngineError::RunFinished {
                run_id: state.run_id,
                status: state.status,
            });
        }

        if let Some(raised) = self.options.budget_ceiling
            && let Some(current) = state.budget_ceiling
            && raised > current
        {
            info!(run_id = %state.run_id, from = current, to = raised, "budget ceiling raised");
            state.budget_ceiling = Some(raised);
        }

        let recovered = self.scheduler.recover_interrupted(self.store.as_ref())?;
        if !recovered.is_empty() {
            warn!(run_id = %state.run_id, items = ?recovered, "settled interrupted attempts");
        }
        info!(
            run_id = %state.run_id,
            status = %state.status,
            phase = ?state.current_phase_id,
            "resuming run"
        );
        self.drive(state).await
    }

    fn abort_requested(&self) -> Result<bool, EngineError> {
        Ok(self.cancel.is_cancelled() || self.store.abort_requested()?)
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.events {
            tx.send(event).await.ok();
        }
    }

    fn checkpoint(&self, state: &mut RunState) -> Result<(), EngineError> {
        persist(self.store.as_ref(), state)
    }

    async fn drive(&self, mut state: RunState) -> Result<RunReport, EngineError> {
        loop {
            if state.status.is_terminal() {
                break;
            }
            if self.abort_requested()? {
                self.cancel.cancel();
                finalize_abort(self.store.as_ref(), &mut state)?;
                self.emit(RunEvent::RunHalted {
                    status: state.status,
                    reason: state.halt_reason,
                })
                .await;
                break;
            }

            if state.budget_halted() {
                if state.budget_exhausted() {
                    break;
                }
                info!(run_id = %state.run_id, "budget available again; continuing");
                state.status = RunStatus::Running;
                state.halt_reason = None;
                self.checkpoint(&mut state)?;
                continue;
            }

            if state.status == RunStatus::AwaitingExternalDecision {
                if self.apply_decision(&mut state).await? {
                    continue;
                }
                if self.options.wait_for_decisions {
                    self.wait_for_decision().await;
                    continue;
                }
                break;
            }

            self.step(&mut state).await?;
        }

        if state.status != RunStatus::Complete && !state.status.is_terminal() {
            self.emit(RunEvent::RunHalted {
                status: state.status,
                reason: state.halt_reason,
            })
            .await;
        }
        RunReport::from_state(self.store.as_ref(), &state)
    }

    /// Sleep until a decision arrives, the run is cancelled, or a tick passes.
    ///
    /// The tick catches decisions written by another process.
    async fn wait_for_decision(&self) {
        tokio::select! {
            _ = self.decisions.notified() => {}
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.options.dispatch.tick_interval) => {}
        }
    }

    /// Advance the run by one phase-state transition.
    async fn step(&self, state: &mut RunState) -> Result<(), EngineError> {
        let Some(phase_id) = state.current_phase_id.clone() else {
            return self.select_next_phase(state).await;
        };
        let phase = self.definition.phase(&phase_id).ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!(
                "phase {} is not in run definition {}",
                phase_id,
                self.definition.name
            ))
        })?;

        match state.phase_state {
            PhaseState::NotStarted | PhaseState::Retrying => self.enter_phase(state, phase).await,
            PhaseState::Running => self.run_phase(state, phase).await,
            PhaseState::AwaitingGate => self.gate_phase(state, phase).await,
            PhaseState::Advanced => self.advance_phase(state, phase).await,
            PhaseState::Blocked => self.block_phase(state, phase).await,
            PhaseState::AwaitingExternalDecision => {
                state.status = RunStatus::AwaitingExternalDecision;
                self.checkpoint(state)
            }
            PhaseState::Complete => {
                state.complete_phase();
                self.checkpoint(state)
            }
        }
    }

    async fn select_next_phase(&self, state: &mut RunState) -> Result<(), EngineError> {
        match self.scheduler.next_phase(&state.completed_phases) {
            Some(next) => {
                state.current_phase_id = Some(next.to_string());
                state.phase_state = PhaseState::NotStarted;
                state.phase_attempt = 0;
            }
            None => {
                state.status = RunStatus::Complete;
                self.checkpoint(state)?;
                info!(
                    run_id = %state.run_id,
                    phases = state.completed_phases.len(),
                    budget_consumed = state.budget_consumed,
                    "run complete"
                );
                self.emit(RunEvent::RunCompleted).await;
            }
        }
        Ok(())
    }

    async fn enter_phase(&self, state: &mut RunState, phase: &Phase) -> Result<(), EngineError> {
        let created = self.scheduler.enter(self.store.as_ref(), phase)?;
        state.transition(PhaseEvent::Enter)?;
        state.status = RunStatus::Running;
        state.pending_work_items = unsettled_items(self.store.as_ref(), &phase.id)?;
        self.checkpoint(state)?;
        info!(
            run_id = %state.run_id,
            phase = %phase.id,
            attempt = state.phase_attempt,
            created,
            "phase entered"
        );
        self.emit(RunEvent::PhaseEntered {
            phase: phase.id.clone(),
            attempt: state.phase_attempt,
            created,
        })
        .await;
        Ok(())
    }

    async fn run_phase(&self, state: &mut RunState, phase: &Phase) -> Result<(), EngineError> {
        let items = self.store.list_by_phase(&phase.id, None)?;
        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.executor.clone(),
            self.rollback.clone(),
            self.cancel.clone(),
            self.options.dispatch.clone(),
        )
        .with_deployment(self.deployment.clone());
        let mut budget = BudgetMeter::new(
            state.budget_unit,
            state.budget_ceiling,
            state.budget_consumed,
        );

        let report = {
            let store = self.store.as_ref();
            let cancel = &self.cancel;
            let ticked = &mut *state;
            let mut on_tick = |meter: &BudgetMeter| -> Result<(), EngineError> {
                if store.abort_requested()? {
                    cancel.cancel();
                }
                ticked.budget_consumed = meter.consumed();
                ticked.pending_work_items = unsettled_items(store, &phase.id)?;
                persist(store, ticked)
            };
            dispatcher
                .dispatch(phase, items, &mut budget, &mut on_tick)
                .await?
        };
        state.budget_consumed = budget.consumed();

        let succeeded = report
            .results
            .iter()
            .filter(|r| r.status == WorkItemStatus::Succeeded)
            .count();
        self.emit(RunEvent::PhaseDispatched {
            phase: phase.id.clone(),
            attempts: report.results.len(),
            succeeded,
        })
        .await;

        match report.halt {
            // The abort is finalized at the top of the drive loop.
            DispatchHalt::Cancelled => Ok(()),
            DispatchHalt::BudgetExceeded => {
                state.halt(RunStatus::Blocked, HaltReason::BudgetExceeded);
                state.pending_work_items = unsettled_items(self.store.as_ref(), &phase.id)?;
                self.checkpoint(state)?;
                warn!(
                    run_id = %state.run_id,
                    phase = %phase.id,
                    consumed = state.budget_consumed,
                    ceiling = ?state.budget_ceiling,
                    "budget exceeded; run halted without rollback"
                );
                Ok(())
            }
            DispatchHalt::Settled | DispatchHalt::StopCondition | DispatchHalt::IterationLimit => {
                state.transition(PhaseEvent::WorkSettled)?;
                state.status = RunStatus::AwaitingGate;
                state.pending_work_items = unsettled_items(self.store.as_ref(), &phase.id)?;
                self.checkpoint(state)
            }
        }
    }

    async fn gate_phase(&self, state: &mut RunState, phase: &Phase) -> Result<(), EngineError> {
        let gate_id = phase.gate_id();
        let gate = self
            .definition
            .gate_for(phase)
            .ok_or_else(|| DefinitionError::UnknownGate {
                phase: phase.id.clone(),
                gate: gate_id.to_string(),
            })?;
        let items = self.store.list_by_phase(&phase.id, None)?;
        let result = self
            .gates
            .evaluate(phase, gate_id, &gate, &items, state.phase_attempt)
            .await?;
        self.store.append_gate_result(&result)?;
        self.emit(RunEvent::GateEvaluated {
            phase: phase.id.clone(),
            gate: gate_id.to_string(),
            total: result.total,
            threshold: result.threshold,
            passed: result.passed,
        })
        .await;

        if !result.passed {
            let failure = EngineError::GateFailure {
                phase_id: phase.id.clone(),
                gate_id: gate_id.to_string(),
                total: result.total,
                threshold: result.threshold,
            };
            return self
                .fail_gate(state, phase, &result.flagged_items, &result.notes, failure.to_string())
                .await;
        }

        if phase.merge_on_pass {
            let refused = self.merge_changes(phase, &items).await;
            if !refused.is_empty() {
                let notes = format!("merge refused for {}", refused.join(", "));
                return self.fail_gate(state, phase, &refused, &notes, notes.clone()).await;
            }
        }

        state.transition(PhaseEvent::GatePassed)?;
        state.record(
            &phase.id,
            PhaseOutcome::Passed,
            Some(format!("{} scored {} / {}", gate_id, result.total, result.threshold)),
        );
        state.status = RunStatus::Running;
        self.checkpoint(state)
    }

    /// Merge every change the phase opened. Returns the items whose merge failed.
    async fn merge_changes(&self, phase: &Phase, items: &[WorkItem]) -> Vec<String> {
        let Some(provider) = &self.deployment else {
            return Vec::new();
        };
        let mut refused = Vec::new();
        for item in effective_items(items) {
            let Some(change) = item.change_ref.clone().map(ChangeRef) else {
                continue;
            };
            match provider.merge(&change).await {
                Ok(true) => info!(phase = %phase.id, item = %item.id, %change, "change merged"),
                Ok(false) => {
                    warn!(phase = %phase.id, item = %item.id, %change, "merge refused");
                    refused.push(item.id.clone());
                }
                Err(e) => {
                    warn!(phase = %phase.id, item = %item.id, %change, error = %e, "merge failed");
                    refused.push(item.id.clone());
                }
            }
        }
        refused
    }

    /// Retry with a narrowed work set, or block once the retry budget is spent.
    async fn fail_gate(
        &self,
        state: &mut RunState,
        phase: &Phase,
        flagged: &[String],
        notes: &str,
        detail: String,
    ) -> Result<(), EngineError> {
        if state.phase_attempt < phase.max_retries {
            let plan = self
                .scheduler
                .plan_retry(self.store.as_ref(), phase, flagged, notes)?;
            state.record(&phase.id, PhaseOutcome::GateFailed, Some(detail));
            state.transition(PhaseEvent::GateFailed)?;
            state.phase_attempt += 1;
            state.status = RunStatus::Running;
            self.checkpoint(state)?;
            warn!(
                run_id = %state.run_id,
                phase = %phase.id,
                attempt = state.phase_attempt,
                max_retries = phase.max_retries,
                "gate failed; retrying"
            );
            let RetryPlan { requeued, revised } = plan;
            self.emit(RunEvent::PhaseRetrying {
                phase: phase.id.clone(),
                attempt: state.phase_attempt,
                requeued,
                revised,
            })
            .await;
        } else {
            state.record(&phase.id, PhaseOutcome::Blocked, Some(detail));
            state.transition(PhaseEvent::RetriesExhausted)?;
            state.halt(RunStatus::Blocked, HaltReason::RetriesExhausted);
            self.checkpoint(state)?;
            warn!(
                run_id = %state.run_id,
                phase = %phase.id,
                retries = state.phase_attempt,
                "gate retries exhausted; phase blocked"
            );
        }
        Ok(())
    }

    async fn advance_phase(&self, state: &mut RunState, phase: &Phase) -> Result<(), EngineError> {
        self.rollback.discard(&phase.id);
        let overridden = state
            .phase_history
            .last()
            .is_some_and(|h| h.phase_id == phase.id && h.outcome == PhaseOutcome::OperatorAdvance);
        state.transition(PhaseEvent::Finish)?;
        state.complete_phase();
        state.status = RunStatus::Running;
        self.checkpoint(state)?;
        info!(run_id = %state.run_id, phase = %phase.id, overridden, "phase advanced");
        self.emit(RunEvent::PhaseAdvanced {
            phase: phase.id.clone(),
            overridden,
        })
        .await;
        Ok(())
    }

    /// Roll the phase back and escalate to an operator decision.
    async fn block_phase(&self, state: &mut RunState, phase: &Phase) -> Result<(), EngineError> {
        let mut reason = format!(
            "phase {} blocked: gate '{}' failed after {} retries",
            phase.id,
            phase.gate_id(),
            state.phase_attempt
        );

        if phase.rollback_on_block {
            match self.rollback.rollback(&phase.id).await {
                Ok(ran) => {
                    info!(phase = %phase.id, compensations = ran, "phase rolled back");
                    state.record(
                        &phase.id,
                        PhaseOutcome::RolledBack,
                        Some(format!("{} compensations run", ran)),
                    );
                }
                Err(e) => {
                    warn!(phase = %phase.id, error = %e, "rollback failed");
                    state.record(&phase.id, PhaseOutcome::RollbackFailed, Some(e.to_string()));
                    state.halt_reason = Some(HaltReason::RollbackFailed);
                    reason = format!("{}; {}", reason, e);
                }
            }
        }

        let decisions = self.store.list_decisions()?;
        let decision = match decisions
            .iter()
            .find(|d| d.phase_id == phase.id && !d.is_resolved())
        {
            Some(open) => open.clone(),
            None => {
                let ordinal = decisions.iter().filter(|d| d.phase_id == phase.id).count() + 1;
                let decision = DecisionRecord::new(&state.run_id, &phase.id, ordinal, reason.clone());
                self.store.put_decision(&decision)?;
                decision
            }
        };

        state.transition(PhaseEvent::Escalate)?;
        state.status = RunStatus::AwaitingExternalDecision;
        state.pending_decision = Some(decision.id.clone());
        self.checkpoint(state)?;
        warn!(
            run_id = %state.run_id,
            phase = %phase.id,
            decision = %decision.id,
            "awaiting external decision"
        );
        self.emit(RunEvent::PhaseBlocked {
            phase: phase.id.clone(),
            reason,
        })
        .await;
        self.emit(RunEvent::DecisionRequired {
            phase: phase.id.clone(),
            decision_id: decision.id,
        })
        .await;
        Ok(())
    }

    /// Apply a resolved pending decision. Returns false while it is still open.
    async fn apply_decision(&self, state: &mut RunState) -> Result<bool, EngineError> {
        let Some(decision_id) = state.pending_decision.clone() else {
            return Ok(false);
        };
        let Some(choice) = self
            .store
            .get_decision(&decision_id)?
            .and_then(|d| d.choice())
        else {
            return Ok(false);
        };
        let Some(phase_id) = state.current_phase_id.clone() else {
            return Ok(false);
        };
        info!(run_id = %state.run_id, decision = %decision_id, %choice, "applying decision");

        match choice {
            DecisionChoice::Abort => {
                self.cancel.cancel();
                finalize_abort(self.store.as_ref(), state)?;
                return Ok(true);
            }
            DecisionChoice::Retry => {
                let phase = self.definition.phase(&phase_id).ok_or_else(|| {
                    EngineError::Other(anyhow::anyhow!("phase {} is not in run definition", phase_id))
                })?;
                let last: Option<GateResult> = self.store.gate_history(&phase_id)?.pop();
                let (flagged, notes) = last
                    .map(|g| (g.flagged_items, g.notes))
                    .unwrap_or_default();
                self.scheduler
                    .plan_retry(self.store.as_ref(), phase, &flagged, &notes)?;
                state.transition(PhaseEvent::OperatorRetry)?;
                state.record(&phase_id, PhaseOutcome::OperatorRetry, Some(decision_id));
                state.phase_attempt = 0;
            }
            DecisionChoice::Advance => {
                state.transition(PhaseEvent::OperatorAdvance)?;
                state.record(&phase_id, PhaseOutcome::OperatorAdvance, Some(decision_id));
            }
        }
        state.pending_decision = None;
        state.halt_reason = None;
        state.status = RunStatus::Running;
        self.checkpoint(state)?;
        Ok(true)
    }
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("run_id", &self.store.run_id())
            .field("definition", &self.definition.name)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{Check, CheckSpec, GateDefinition, RubricDimension};
    use crate::phase::{PhaseMode, WorkItemSpec};
    use crate::store::{
        AttemptLog, CheckpointStore, DecisionStore, GateStore, MemoryStore, WorkItemStore,
    };
    use crate::testing::{FakeDeployment, QueuedScorer, ScriptedExecutor, Step, scores};
    use serde_json::json;
    use std::time::Duration;

    /// Tick interval that keeps tests fast.
    fn fast_options() -> RunOptions {
        RunOptions {
            dispatch: DispatchConfig {
                concurrency_limit: 4,
                item_timeout: Some(Duration::from_secs(5)),
                tick_interval: Duration::from_millis(50),
            },
            ..Default::default()
        }
    }

    fn specs(ids: &[&str]) -> Vec<WorkItemSpec> {
        ids.iter().map(|id| WorkItemSpec::new(id, json!({}))).collect()
    }

    fn two_phase() -> RunDefinition {
        RunDefinition::new(
            "release",
            vec![
                Phase::new("build", "Build", 0)
                    .with_mode(PhaseMode::Parallel)
                    .with_items(specs(&["a", "b", "c"])),
                Phase::new("deploy", "Deploy", 1).with_items(specs(&["ship"])),
            ],
        )
    }

    fn controller(
        store: &Arc<MemoryStore>,
        definition: RunDefinition,
        executor: &Arc<ScriptedExecutor>,
    ) -> RunController {
        RunController::new(store.clone(), definition, executor.clone())
            .unwrap()
            .with_options(fast_options())
    }

    fn status_of(store: &MemoryStore, id: &str) -> WorkItemStatus {
        store.get(id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_run_completes_all_phases() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let executor = Arc::new(ScriptedExecutor::new());
        let report = controller(&store, two_phase(), &executor)
            .start()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.completed_phases, vec!["build", "deploy"]);
        assert_eq!(report.items.get(&WorkItemStatus::Succeeded), Some(&4));
        assert_eq!(executor.calls().len(), 4);

        let state = store.load_checkpoint().unwrap().unwrap();
        assert!(state.last_checkpoint_at >= state.started_at);
        assert!(state.pending_work_items.is_empty());
        assert_eq!(store.gate_history("build").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let executor = Arc::new(ScriptedExecutor::new());
        let ctl = controller(&store, two_phase(), &executor);
        ctl.start().await.unwrap();
        assert!(matches!(ctl.start().await, Err(EngineError::RunExists(_))));
        assert!(matches!(ctl.resume().await, Err(EngineError::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_resume_never_redispatches_succeeded_items() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = two_phase();
        let executor = Arc::new(ScriptedExecutor::new());

        // Simulate a process that died mid-phase: checkpoint says Running,
        // `a` succeeded, `b` was in flight, `c` never started.
        let scheduler = PhaseScheduler::new(&definition).unwrap();
        store.save_definition(&definition).unwrap();
        scheduler
            .enter(store.as_ref(), definition.phase("build").unwrap())
            .unwrap();
        store
            .compare_and_update("a", WorkItemStatus::Pending, &mut |i| {
                i.status = WorkItemStatus::Dispatched;
                i.attempt_count = 1;
            })
            .unwrap();
        store
            .update_status("a", WorkItemStatus::Dispatched, WorkItemStatus::Succeeded)
            .unwrap();
        store
            .compare_and_update("b", WorkItemStatus::Pending, &mut |i| {
                i.status = WorkItemStatus::Dispatched;
                i.attempt_count = 1;
            })
            .unwrap();
        let mut state = RunState::new("run-1", "release");
        state.current_phase_id = Some("build".into());
        state.phase_state = PhaseState::Running;
        store.save_checkpoint(&state, 0).unwrap();

        let report = controller(&store, definition, &executor)
            .resume()
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(executor.call_count("a"), 0);
        assert_eq!(executor.call_count("b"), 1);
        assert_eq!(executor.call_count("c"), 1);
        assert_eq!(store.get("b").unwrap().unwrap().total_attempts, 1);
        assert_eq!(store.get("b").unwrap().unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn test_bounded_retries_block_and_escalate() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let mut build = Phase::new("build", "Build", 0)
            .with_items(vec![WorkItemSpec::new("flaky", json!({})).with_max_attempts(2)])
            .with_max_retries(1);
        build.rollback_on_block = true;
        let definition = RunDefinition::new("release", vec![build]);
        let executor = Arc::new(
            ScriptedExecutor::new().script("flaky", vec![Step::Transient; 10]),
        );

        let report = controller(&store, definition, &executor)
            .start()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::AwaitingExternalDecision);
        assert_eq!(report.halt_reason, Some(HaltReason::RetriesExhausted));
        assert_eq!(report.exit_code, 1);
        // Two attempts per round, one retry round.
        assert_eq!(executor.call_count("flaky"), 4);
        assert_eq!(status_of(&store, "flaky"), WorkItemStatus::Blocked);
        assert_eq!(store.get("flaky").unwrap().unwrap().total_attempts, 4);

        let decision = report.pending_decision.unwrap();
        assert_eq!(decision.id, "build-d1");
        assert!(!decision.is_resolved());
        assert_eq!(store.gate_history("build").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_item_fails_a_passing_command_gate() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "release",
            vec![
                Phase::new("build", "Build", 0)
                    .with_items(vec![
                        WorkItemSpec::new("ok", json!({})),
                        WorkItemSpec::new("bad", json!({})).with_max_attempts(1),
                    ])
                    .with_gate("ci")
                    .with_max_retries(0),
            ],
        )
        .with_gate(
            "ci",
            GateDefinition::Deterministic {
                checks: vec![CheckSpec::new(
                    "smoke",
                    Check::Command {
                        command: "true".into(),
                    },
                )],
            },
        );
        let executor = Arc::new(ScriptedExecutor::new().script("bad", vec![Step::Transient]));
        let report = controller(&store, definition, &executor)
            .start()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::AwaitingExternalDecision);
        assert_eq!(report.exit_code, 1);
        assert_eq!(status_of(&store, "bad"), WorkItemStatus::Blocked);
        let gate = &store.gate_history("build").unwrap()[0];
        assert!(!gate.passed);
        assert_eq!(gate.flagged_items, vec!["bad"]);
        assert!(report.completed_phases.is_empty());
    }

    #[tokio::test]
    async fn test_rubric_retry_narrows_to_flagged_items() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "docs",
            vec![
                Phase::new("write", "Write", 0)
                    .with_items(specs(&["intro", "guide", "faq"]))
                    .with_gate("review"),
            ],
        )
        .with_gate(
            "review",
            GateDefinition::Rubric {
                dimensions: (0..5).map(|i| RubricDimension::new(&format!("d{}", i))).collect(),
                threshold: 18.0,
                scorer: None,
            },
        );
        let scorer = Arc::new(QueuedScorer::new(vec![
            scores(&[3.0; 5], &["guide"], "guide is vague"),
            scores(&[4.0, 4.0, 3.0, 4.0, 4.0], &[], "good"),
        ]));
        let executor = Arc::new(ScriptedExecutor::new());
        let report = controller(&store, definition, &executor)
            .with_gate_evaluator(GateEvaluator::new().with_scorer(Some(scorer)))
            .start()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(executor.calls(), vec!["intro", "guide", "faq", "guide~r1"]);
        let revision = store.get("guide~r1").unwrap().unwrap();
        assert_eq!(revision.feedback.as_deref(), Some("guide is vague"));
        assert_eq!(status_of(&store, "guide"), WorkItemStatus::Succeeded);

        let history = store.gate_history("write").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].total, 15.0);
        assert!(!history[0].passed);
        assert_eq!(history[1].total, 19.0);
        assert!(history[1].passed);
        assert_eq!(history[1].attempt, 1);
    }

    #[tokio::test]
    async fn test_budget_halt_then_resume_with_raised_ceiling() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "batch",
            vec![Phase::new("work", "Work", 0).with_items(specs(&["i1", "i2", "i3", "i4", "i5"]))],
        );
        let executor = Arc::new(ScriptedExecutor::new().with_default_cost(40));
        let mut options = fast_options();
        options.budget_ceiling = Some(100);

        let report = controller(&store, definition.clone(), &executor)
            .with_options(options.clone())
            .start()
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Blocked);
        assert_eq!(report.halt_reason, Some(HaltReason::BudgetExceeded));
        assert_eq!(report.exit_code, 3);
        assert_eq!(report.budget_consumed, 120);
        assert_eq!(report.items.get(&WorkItemStatus::Succeeded), Some(&3));
        assert_eq!(report.items.get(&WorkItemStatus::Pending), Some(&2));
        assert!(report.completed_phases.is_empty());

        // Resuming without more budget stays halted.
        let again = controller(&store, definition.clone(), &executor)
            .with_options(options.clone())
            .resume()
            .await
            .unwrap();
        assert_eq!(again.exit_code, 3);
        assert_eq!(executor.calls().len(), 3);

        options.budget_ceiling = Some(500);
        let done = controller(&store, definition, &executor)
            .with_options(options)
            .resume()
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Complete);
        assert_eq!(done.budget_consumed, 200);
        assert_eq!(executor.calls().len(), 5);
    }

    #[tokio::test]
    async fn test_decide_retry_then_advance() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "release",
            vec![
                Phase::new("build", "Build", 0)
                    .with_items(vec![WorkItemSpec::new("x", json!({})).with_max_attempts(1)])
                    .with_max_retries(0),
                Phase::new("deploy", "Deploy", 1).with_items(specs(&["ship"])),
            ],
        );
        let executor = Arc::new(
            ScriptedExecutor::new().script("x", vec![Step::Permanent, Step::Permanent]),
        );

        let ctl = controller(&store, definition.clone(), &executor);
        let report = ctl.start().await.unwrap();
        let decision = report.pending_decision.unwrap();
        assert_eq!(report.status, RunStatus::AwaitingExternalDecision);

        ctl.handle().decide(&decision.id, DecisionChoice::Retry).unwrap();
        let report = ctl.resume().await.unwrap();
        assert_eq!(executor.call_count("x"), 2);
        let second = report.pending_decision.unwrap();
        assert_eq!(second.id, "build-d2");

        ctl.handle().decide(&second.id, DecisionChoice::Advance).unwrap();
        let report = ctl.resume().await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(executor.call_count("ship"), 1);

        let state = store.load_checkpoint().unwrap().unwrap();
        assert!(
            state
                .phase_history
                .iter()
                .any(|h| h.outcome == PhaseOutcome::OperatorAdvance)
        );
        assert!(matches!(
            ctl.handle().decide(&second.id, DecisionChoice::Retry),
            Err(EngineError::RunFinished { .. })
        ));
    }

    #[tokio::test]
    async fn test_decide_unknown_or_resolved() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "release",
            vec![
                Phase::new("build", "Build", 0)
                    .with_items(vec![WorkItemSpec::new("x", json!({})).with_max_attempts(1)])
                    .with_max_retries(0),
            ],
        );
        let executor = Arc::new(ScriptedExecutor::new().script("x", vec![Step::Permanent]));
        let ctl = controller(&store, definition, &executor);
        let report = ctl.start().await.unwrap();
        let id = report.pending_decision.unwrap().id;

        assert!(matches!(
            resolve_decision(store.as_ref(), "nope", DecisionChoice::Retry),
            Err(EngineError::DecisionNotFound { .. })
        ));
        resolve_decision(store.as_ref(), &id, DecisionChoice::Advance).unwrap();
        assert!(matches!(
            resolve_decision(store.as_ref(), &id, DecisionChoice::Retry),
            Err(EngineError::DecisionResolved(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_paused_run_cancels_outstanding_items() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "release",
            vec![
                Phase::new("build", "Build", 0)
                    .with_items(vec![WorkItemSpec::new("x", json!({})).with_max_attempts(1)])
                    .with_max_retries(0),
            ],
        );
        let executor = Arc::new(ScriptedExecutor::new().script("x", vec![Step::Transient]));
        let ctl = controller(&store, definition, &executor);
        ctl.start().await.unwrap();
        assert_eq!(status_of(&store, "x"), WorkItemStatus::Blocked);

        let report = abort_run(store.as_ref()).unwrap();
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.exit_code, 2);
        assert_eq!(status_of(&store, "x"), WorkItemStatus::Cancelled);
        assert_eq!(
            store.list_decisions().unwrap()[0].choice(),
            Some(DecisionChoice::Abort)
        );
        assert!(matches!(
            abort_run(store.as_ref()),
            Err(EngineError::RunFinished { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_in_flight_marks_items_cancelled() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "release",
            vec![
                Phase::new("build", "Build", 0)
                    .with_mode(PhaseMode::Parallel)
                    .with_items(specs(&["slow", "later"])),
            ],
        );
        let mut options = fast_options();
        options.dispatch.concurrency_limit = 1;
        let executor = Arc::new(ScriptedExecutor::new().script("slow", vec![Step::WaitForCancel]));
        let ctl = controller(&store, definition, &executor).with_options(options);
        let handle = ctl.handle();

        let run = tokio::spawn(async move { ctl.start().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort().unwrap();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.halt_reason, Some(HaltReason::OperatorAbort));
        assert_eq!(status_of(&store, "slow"), WorkItemStatus::Cancelled);
        assert_eq!(status_of(&store, "later"), WorkItemStatus::Cancelled);
        assert_eq!(executor.call_count("later"), 0);
    }

    #[tokio::test]
    async fn test_waiting_controller_wakes_on_decision() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "release",
            vec![
                Phase::new("build", "Build", 0)
                    .with_items(vec![WorkItemSpec::new("x", json!({})).with_max_attempts(1)])
                    .with_max_retries(0),
            ],
        );
        let executor = Arc::new(ScriptedExecutor::new().script("x", vec![Step::Permanent]));
        let mut options = fast_options();
        options.wait_for_decisions = true;
        let ctl = controller(&store, definition, &executor).with_options(options);
        let handle = ctl.handle();

        let run = tokio::spawn(async move { ctl.start().await });
        let decision_id = loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(d) = store.list_decisions().unwrap().into_iter().next() {
                break d.id;
            }
        };
        handle.decide(&decision_id, DecisionChoice::Advance).unwrap();
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn test_rollback_runs_on_block_and_only_for_that_phase() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "release",
            vec![
                Phase::new("build", "Build", 0).with_items(specs(&["lib"])),
                Phase::new("deploy", "Deploy", 1)
                    .with_items(vec![
                        WorkItemSpec::new("site", json!({})),
                        WorkItemSpec::new("api", json!({})).with_max_attempts(1),
                    ])
                    .with_max_retries(0),
            ],
        );
        let deployment = Arc::new(FakeDeployment::new());
        let executor = Arc::new(
            ScriptedExecutor::new()
                .script("lib", vec![Step::Diff("+lib".into())])
                .script("site", vec![Step::Diff("+site".into())])
                .script("api", vec![Step::Permanent]),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let ctl = controller(&store, definition, &executor)
            .with_deployment(Some(deployment.clone()))
            .with_event_channel(tx);
        let run = tokio::spawn(async move { ctl.start().await });

        // Snapshot the build phase as soon as it advances.
        let mut build_snapshot = None;
        while let Some(event) = rx.recv().await {
            if matches!(&event, RunEvent::PhaseAdvanced { phase, .. } if phase == "build") {
                build_snapshot = Some((
                    store.get("lib").unwrap().unwrap(),
                    store.gate_history("build").unwrap(),
                ));
            }
        }
        let report = run.await.unwrap().unwrap();
        let (lib_before, gates_before) = build_snapshot.unwrap();

        assert_eq!(report.status, RunStatus::AwaitingExternalDecision);
        // change-1 belongs to the passed build phase, change-2 to deploy.
        assert_eq!(*deployment.closed.lock().unwrap(), vec!["change-2"]);
        assert_eq!(store.get("lib").unwrap().unwrap(), lib_before);
        assert_eq!(store.gate_history("build").unwrap(), gates_before);
        assert_eq!(status_of(&store, "lib"), WorkItemStatus::Succeeded);
        let state = store.load_checkpoint().unwrap().unwrap();
        assert!(
            state
                .phase_history
                .iter()
                .any(|h| h.phase_id == "deploy" && h.outcome == PhaseOutcome::RolledBack)
        );
    }

    #[tokio::test]
    async fn test_failed_rollback_is_surfaced_to_decision() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "release",
            vec![
                Phase::new("deploy", "Deploy", 0)
                    .with_items(vec![
                        WorkItemSpec::new("site", json!({})),
                        WorkItemSpec::new("api", json!({})).with_max_attempts(1),
                    ])
                    .with_max_retries(0),
            ],
        );
        let mut deployment = FakeDeployment::new();
        deployment.fail_close = true;
        let executor = Arc::new(
            ScriptedExecutor::new()
                .script("site", vec![Step::Diff("+site".into())])
                .script("api", vec![Step::Permanent]),
        );
        let report = controller(&store, definition, &executor)
            .with_deployment(Some(Arc::new(deployment)))
            .start()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::AwaitingExternalDecision);
        assert_eq!(report.halt_reason, Some(HaltReason::RollbackFailed));
        assert!(report.pending_decision.unwrap().reason.contains("Rollback"));
    }

    #[tokio::test]
    async fn test_merge_on_pass_merges_opened_changes() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let mut phase = Phase::new("deploy", "Deploy", 0).with_items(specs(&["site"]));
        phase.merge_on_pass = true;
        let definition = RunDefinition::new("release", vec![phase]);
        let deployment = Arc::new(FakeDeployment::new());
        let executor =
            Arc::new(ScriptedExecutor::new().script("site", vec![Step::Diff("+site".into())]));
        let report = controller(&store, definition, &executor)
            .with_deployment(Some(deployment.clone()))
            .start()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(*deployment.merged.lock().unwrap(), vec!["change-1"]);
        assert!(deployment.closed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attempt_log_records_timeout_then_success() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let definition = RunDefinition::new(
            "release",
            vec![Phase::new("build", "Build", 0).with_items(specs(&["A"]))],
        );
        let mut options = fast_options();
        options.dispatch.item_timeout = Some(Duration::from_millis(50));
        let executor = Arc::new(ScriptedExecutor::new().script("A", vec![Step::Hang, Step::Succeed]));
        let report = controller(&store, definition, &executor)
            .with_options(options)
            .start()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Complete);
        let log = crate::audit::summarize(&store.attempts().unwrap());
        assert_eq!(log, vec!["A:timeout", "A:ok"]);
        assert_eq!(store.get("A").unwrap().unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let store = Arc::new(MemoryStore::new("run-1"));
        let executor = Arc::new(ScriptedExecutor::new());
        let (tx, mut rx) = mpsc::channel(100);
        controller(&store, two_phase(), &executor)
            .with_event_channel(tx)
            .start()
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("phase_entered"));
        assert_eq!(kinds.last().map(String::as_str), Some("run_completed"));
        assert_eq!(kinds.iter().filter(|k| *k == "phase_advanced").count(), 2);
    }
}
