//! Worker dispatcher.
//!
//! Claims a phase's pending work items in `(priority, sequence)` order,
//! runs them on the executor as tokio tasks bounded by a semaphore, and
//! writes each attempt's outcome back to the store. Sequential phases use a
//! limit of one.
//!
//! Per attempt the dispatcher:
//! - claims the item with a `Pending -> Dispatched` CAS that bumps its attempt counters
//! - races the executor against the item timeout and run cancellation
//! - charges the run budget and appends an attempt record
//! - settles the item: `Succeeded`, `Cancelled`, `Failed`, or back to `Pending`/`Blocked` via `Failed`
//!
//! Dispatch stops claiming new work on cancellation, an exhausted budget, the
//! phase's iteration bound, or its stop condition. In-flight attempts always
//! run to completion before `dispatch` returns.

mod budget;

pub use budget::{BudgetMeter, BudgetUnit};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AttemptOutcome, AttemptRecord};
use crate::errors::{EngineError, StoreError};
use crate::phase::{Phase, PhaseMode, StopCondition};
use crate::providers::{
    ChangeRef, DeploymentProvider, ExecutionContext, ExecutionResult, Executor, WorkerError,
};
use crate::rollback::{RollbackController, compensation};
use crate::store::RunStore;
use crate::work_item::{
    ItemError, ItemErrorKind, WorkItem, WorkItemStatus, effective_items, sort_by_dispatch_order,
};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Parallel-mode limit on concurrent attempts
    pub concurrency_limit: usize,
    /// Per-attempt timeout; `None` waits indefinitely
    pub item_timeout: Option<Duration>,
    /// Interval of the periodic checkpoint tick
    pub tick_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            item_timeout: Some(Duration::from_secs(600)),
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Why dispatch stopped claiming work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchHalt {
    /// Nothing left to dispatch
    Settled,
    StopCondition,
    IterationLimit,
    BudgetExceeded,
    Cancelled,
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub item_id: String,
    pub outcome: AttemptOutcome,
    pub error: Option<ItemError>,
    pub duration: Duration,
    /// Status the item was left in
    pub status: WorkItemStatus,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub results: Vec<DispatchResult>,
    /// Item ids in the order they were claimed
    pub dispatch_order: Vec<String>,
    pub halt: DispatchHalt,
}

/// Periodic callback: persist progress, poll for out-of-process aborts.
pub type TickFn<'a> = dyn FnMut(&BudgetMeter) -> Result<(), EngineError> + Send + 'a;

struct Completion {
    item: WorkItem,
    result: Result<ExecutionResult, ItemError>,
    duration: Duration,
}

pub struct Dispatcher {
    run_id: String,
    store: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
    deployment: Option<Arc<dyn DeploymentProvider>>,
    rollback: Arc<RollbackController>,
    cancel: CancellationToken,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RunStore>,
        executor: Arc<dyn Executor>,
        rollback: Arc<RollbackController>,
        cancel: CancellationToken,
        config: DispatchConfig,
    ) -> Self {
        Self {
            run_id: store.run_id().to_string(),
            store,
            executor,
            deployment: None,
            rollback,
            cancel,
            config,
        }
    }

    pub fn with_deployment(mut self, deployment: Option<Arc<dyn DeploymentProvider>>) -> Self {
        self.deployment = deployment;
        self
    }

    fn limit(&self, mode: PhaseMode) -> usize {
        match mode {
            PhaseMode::Sequential => 1,
            PhaseMode::Parallel => self.config.concurrency_limit.max(1),
        }
    }

    /// Dispatch the phase's `Pending` items among `items`.
    pub async fn dispatch(
        &self,
        phase: &Phase,
        items: Vec<WorkItem>,
        budget: &mut BudgetMeter,
        on_tick: &mut TickFn<'_>,
    ) -> Result<DispatchReport, EngineError> {
        let limit = self.limit(phase.mode);
        let mut pending: Vec<WorkItem> = items
            .into_iter()
            .filter(|i| i.status == WorkItemStatus::Pending)
            .collect();
        sort_by_dispatch_order(&mut pending);
        let mut queue: VecDeque<WorkItem> = pending.into();

        info!(
            run_id = %self.run_id,
            phase = %phase.id,
            items = queue.len(),
            limit,
            "dispatching phase"
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks: JoinSet<Completion> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, WorkItem> = HashMap::new();
        let mut results = Vec::new();
        let mut dispatch_order = Vec::new();
        let mut iterations = 0u32;
        let mut halt: Option<DispatchHalt> = None;

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            while halt.is_none() && semaphore.available_permits() > 0 && !queue.is_empty() {
                if let Some(reason) = self.should_halt(phase, budget, iterations)? {
                    halt = Some(reason);
                    break;
                }
                let Some(item) = queue.pop_front() else {
                    break;
                };
                let claimed = match self.store.compare_and_update(
                    &item.id,
                    WorkItemStatus::Pending,
                    &mut |i| {
                        i.status = WorkItemStatus::Dispatched;
                        i.attempt_count += 1;
                        i.total_attempts += 1;
                    },
                ) {
                    Ok(claimed) => claimed,
                    Err(e) if e.is_conflict() => {
                        debug!(item = %item.id, error = %e, "item claimed elsewhere; skipping");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };

                iterations += 1;
                dispatch_order.push(claimed.id.clone());
                debug!(item = %claimed.id, attempt = claimed.attempt_count, "item dispatched");

                let executor = self.executor.clone();
                let ctx = ExecutionContext::new(
                    &self.run_id,
                    &phase.id,
                    claimed.attempt_count,
                    self.cancel.clone(),
                    self.rollback.clone(),
                );
                let timeout = self.config.item_timeout;
                let task_item = claimed.clone();
                let handle = tasks.spawn(async move {
                    let _permit = permit;
                    let started = Instant::now();
                    let result = run_attempt(executor.as_ref(), &task_item, &ctx, timeout).await;
                    Completion {
                        item: task_item,
                        result,
                        duration: started.elapsed(),
                    }
                });
                in_flight.insert(handle.id(), claimed);
            }

            if tasks.is_empty() {
                if halt.is_none() && !queue.is_empty() {
                    // Everything left was claimed elsewhere.
                    continue;
                }
                break;
            }

            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    let completion = match joined {
                        Some(Ok((id, completion))) => {
                            in_flight.remove(&id);
                            completion
                        }
                        Some(Err(e)) => {
                            let Some(item) = in_flight.remove(&e.id()) else {
                                continue;
                            };
                            warn!(item = %item.id, error = %e, "worker task failed");
                            Completion {
                                item,
                                result: Err(ItemError::new(
                                    ItemErrorKind::Transient,
                                    format!("worker task failed: {}", e),
                                )),
                                duration: Duration::ZERO,
                            }
                        }
                        None => continue,
                    };
                    let result = self.settle(phase, completion, budget, &mut queue).await?;
                    results.push(result);
                }
                _ = ticker.tick() => {
                    on_tick(budget)?;
                }
            }
        }

        let halt = if self.cancel.is_cancelled() {
            DispatchHalt::Cancelled
        } else {
            halt.unwrap_or(DispatchHalt::Settled)
        };
        on_tick(budget)?;
        info!(
            run_id = %self.run_id,
            phase = %phase.id,
            attempts = results.len(),
            halt = ?halt,
            "dispatch finished"
        );
        Ok(DispatchReport {
            results,
            dispatch_order,
            halt,
        })
    }

    fn should_halt(
        &self,
        phase: &Phase,
        budget: &BudgetMeter,
        iterations: u32,
    ) -> Result<Option<DispatchHalt>, EngineError> {
        if self.cancel.is_cancelled() {
            return Ok(Some(DispatchHalt::Cancelled));
        }
        if budget.exhausted() {
            warn!(
                run_id = %self.run_id,
                consumed = budget.consumed(),
                ceiling = ?budget.ceiling(),
                "budget exhausted; halting dispatch"
            );
            return Ok(Some(DispatchHalt::BudgetExceeded));
        }
        if iterations >= phase.max_iterations {
            warn!(phase = %phase.id, iterations, "iteration bound reached");
            return Ok(Some(DispatchHalt::IterationLimit));
        }
        if phase.stop_condition != StopCondition::AllSettled {
            let items = effective_items(&self.store.list_by_phase(&phase.id, None)?);
            if phase.stop_condition.is_met(&items) {
                info!(phase = %phase.id, condition = ?phase.stop_condition, "stop condition met");
                return Ok(Some(DispatchHalt::StopCondition));
            }
        }
        Ok(None)
    }

    /// Record one finished attempt and move the item to its next status.
    async fn settle(
        &self,
        phase: &Phase,
        completion: Completion,
        budget: &mut BudgetMeter,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<DispatchResult, EngineError> {
        let Completion {
            item,
            result,
            duration,
        } = completion;
        let cost = result.as_ref().ok().and_then(|r| r.cost);
        budget.record(cost, duration);

        let result = match result {
            Ok(execution) => match self.open_change(phase, &item, &execution).await {
                Ok(change) => Ok((execution, change)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let (outcome, error, status) = match result {
            Ok((execution, change)) => {
                let settled = self.transition(&item.id, WorkItemStatus::Dispatched, |i| {
                    i.status = WorkItemStatus::Succeeded;
                    i.output = Some(execution.output.clone());
                    i.change_ref = change.as_ref().map(|c| c.0.clone());
                    i.last_error = None;
                })?;
                (
                    AttemptOutcome::Ok,
                    None,
                    settled.map_or(WorkItemStatus::Succeeded, |i| i.status),
                )
            }
            Err(error) => {
                let outcome = match error.kind {
                    ItemErrorKind::Timeout => AttemptOutcome::Timeout,
                    ItemErrorKind::Permanent => AttemptOutcome::PermanentError,
                    ItemErrorKind::Cancelled => AttemptOutcome::Cancelled,
                    ItemErrorKind::Transient | ItemErrorKind::Interrupted => {
                        AttemptOutcome::TransientError
                    }
                };
                let status = self.settle_failure(&item, &error, queue)?;
                (outcome, Some(error), status)
            }
        };

        let mut record = AttemptRecord::new(
            &item.id,
            &phase.id,
            item.attempt_count,
            outcome,
            duration.as_millis() as u64,
        );
        if let Some(error) = &error {
            record = record.with_error(error.message.clone());
        }
        self.store.append_attempt(&record)?;

        Ok(DispatchResult {
            item_id: item.id,
            outcome,
            error,
            duration,
            status,
        })
    }

    fn settle_failure(
        &self,
        item: &WorkItem,
        error: &ItemError,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<WorkItemStatus, EngineError> {
        if error.kind == ItemErrorKind::Cancelled {
            let settled = self.transition(&item.id, WorkItemStatus::Dispatched, |i| {
                i.status = WorkItemStatus::Cancelled;
                i.last_error = Some(error.clone());
            })?;
            return Ok(settled.map_or(WorkItemStatus::Cancelled, |i| i.status));
        }

        let Some(failed) = self.transition(&item.id, WorkItemStatus::Dispatched, |i| {
            i.status = WorkItemStatus::Failed;
            i.last_error = Some(error.clone());
        })?
        else {
            return Ok(WorkItemStatus::Failed);
        };

        if !error.kind.is_retryable() {
            warn!(item = %item.id, error = %error.message, "permanent failure");
            return Ok(WorkItemStatus::Failed);
        }

        if failed.has_attempts_left() {
            warn!(
                item = %item.id,
                attempt = failed.attempt_count,
                max_attempts = failed.max_attempts,
                error = %error.message,
                "attempt failed; re-queueing"
            );
            let requeued = self.transition(&item.id, WorkItemStatus::Failed, |i| {
                i.status = WorkItemStatus::Pending;
            })?;
            if let Some(requeued) = requeued {
                let at = queue.partition_point(|q| {
                    (q.order_key(), q.id.as_str()) <= (requeued.order_key(), requeued.id.as_str())
                });
                queue.insert(at, requeued);
            }
            Ok(WorkItemStatus::Pending)
        } else {
            warn!(item = %item.id, attempts = failed.attempt_count, "attempts exhausted; blocking item");
            let blocked = self.transition(&item.id, WorkItemStatus::Failed, |i| {
                i.status = WorkItemStatus::Blocked;
            })?;
            Ok(blocked.map_or(WorkItemStatus::Blocked, |i| i.status))
        }
    }

    /// CAS that treats a conflict as someone else's win: logged, never surfaced.
    fn transition(
        &self,
        id: &str,
        expected: WorkItemStatus,
        mut mutate: impl FnMut(&mut WorkItem),
    ) -> Result<Option<WorkItem>, EngineError> {
        match self.store.compare_and_update(id, expected, &mut mutate) {
            Ok(item) => Ok(Some(item)),
            Err(e) if e.is_conflict() => {
                warn!(item = id, error = %e, "lost update race; keeping stored status");
                Ok(None)
            }
            Err(e @ StoreError::Immutable { .. }) => {
                warn!(item = id, error = %e, "item already settled");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open a change for the attempt's diff and register its compensation.
    async fn open_change(
        &self,
        phase: &Phase,
        item: &WorkItem,
        execution: &ExecutionResult,
    ) -> Result<Option<ChangeRef>, ItemError> {
        let (Some(diff), Some(deployment)) = (execution.diff.as_deref(), &self.deployment) else {
            return Ok(None);
        };
        let change = deployment.open_change(diff).await.map_err(|e| {
            ItemError::new(
                ItemErrorKind::Transient,
                format!("failed to open change: {:#}", e),
            )
        })?;
        info!(item = %item.id, change = %change, "opened change");

        let provider = deployment.clone();
        let to_close = change.clone();
        self.rollback.register_compensation(
            &phase.id,
            &format!("close change {} ({})", change, item.id),
            compensation(move || async move { provider.close_change(&to_close).await }),
        );
        Ok(Some(change))
    }
}

async fn run_attempt(
    executor: &dyn Executor,
    item: &WorkItem,
    ctx: &ExecutionContext,
    timeout: Option<Duration>,
) -> Result<ExecutionResult, ItemError> {
    let work = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, executor.execute(item, ctx)).await {
                Ok(result) => result.map_err(worker_error),
                Err(_) => Err(ItemError::new(
                    ItemErrorKind::Timeout,
                    format!("timed out after {}ms", limit.as_millis()),
                )),
            },
            None => executor.execute(item, ctx).await.map_err(worker_error),
        }
    };
    tokio::select! {
        result = work => result,
        _ = ctx.cancelled() => Err(ItemError::new(ItemErrorKind::Cancelled, "run cancelled")),
    }
}

fn worker_error(e: WorkerError) -> ItemError {
    match e {
        WorkerError::Transient(message) => ItemError::new(ItemErrorKind::Transient, message),
        WorkerError::Permanent(message) => ItemError::new(ItemErrorKind::Permanent, message),
        WorkerError::Cancelled => ItemError::new(ItemErrorKind::Cancelled, "cancelled by worker"),
    }
}
