//! Phase sequencing and work-set planning.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::audit::{AttemptOutcome, AttemptRecord};
use crate::dag::DagBuilder;
use crate::errors::{DefinitionError, StoreError};
use crate::phase::{Phase, RunDefinition};
use crate::store::RunStore;
use crate::work_item::{
    ItemError, ItemErrorKind, WorkItem, WorkItemStatus, effective_items,
};

/// What a gate-driven retry put back in the phase's queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPlan {
    /// Failed or blocked items moved back to `Pending`
    pub requeued: Vec<String>,
    /// Revision items created for flagged items that had already succeeded
    pub revised: Vec<String>,
}

impl RetryPlan {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.revised.is_empty()
    }
}

/// Decides which phase runs next and which items it dispatches.
#[derive(Debug, Clone)]
pub struct PhaseScheduler {
    order: Vec<String>,
}

impl PhaseScheduler {
    pub fn new(definition: &RunDefinition) -> Result<Self, DefinitionError> {
        let graph = DagBuilder::new(definition.phases.clone()).build()?;
        Ok(Self {
            order: graph.execution_order(),
        })
    }

    /// Phase ids in execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// First phase in execution order that has not completed.
    pub fn next_phase(&self, completed: &[String]) -> Option<&str> {
        self.order
            .iter()
            .find(|id| !completed.contains(id))
            .map(String::as_str)
    }

    /// Create the phase's declared items. Existing ids are left untouched.
    ///
    /// Returns how many items were created.
    pub fn enter(&self, store: &dyn RunStore, phase: &Phase) -> Result<usize, StoreError> {
        let mut created = 0;
        for (sequence, spec) in phase.items.iter().enumerate() {
            let item = spec.instantiate(&phase.id, sequence as u64);
            if store.insert_if_absent(&item)? {
                created += 1;
            } else {
                debug!(phase = %phase.id, item = %item.id, "work item already exists");
            }
        }
        Ok(created)
    }

    /// Narrow the next round to what the gate rejected.
    ///
    /// Failed and blocked items go back to `Pending` with a fresh attempt
    /// budget. Flagged items that already succeeded are immutable, so each
    /// gets a revision carrying the gate notes as feedback.
    pub fn plan_retry(
        &self,
        store: &dyn RunStore,
        phase: &Phase,
        flagged: &[String],
        notes: &str,
    ) -> Result<RetryPlan, StoreError> {
        let all = store.list_by_phase(&phase.id, None)?;
        let mut next_sequence = all.iter().map(|i| i.sequence + 1).max().unwrap_or(0);
        let flagged: HashSet<&str> = flagged.iter().map(String::as_str).collect();
        let feedback = (!notes.trim().is_empty()).then(|| notes.to_string());
        let mut plan = RetryPlan::default();

        for item in effective_items(&all) {
            match item.status {
                WorkItemStatus::Failed | WorkItemStatus::Blocked => {
                    let feedback = flagged
                        .contains(item.id.as_str())
                        .then(|| feedback.clone())
                        .flatten();
                    let requeue = store.compare_and_update(&item.id, item.status, &mut |i| {
                        i.status = WorkItemStatus::Pending;
                        i.attempt_count = 0;
                        if feedback.is_some() {
                            i.feedback = feedback.clone();
                        }
                    });
                    match requeue {
                        Ok(_) => plan.requeued.push(item.id.clone()),
                        Err(e) if e.is_conflict() => {
                            warn!(item = %item.id, error = %e, "item changed while planning retry")
                        }
                        Err(e) => return Err(e),
                    }
                }
                WorkItemStatus::Succeeded if flagged.contains(item.id.as_str()) => {
                    let revision_no = next_revision_no(&all, &item);
                    let revision = item.revision(revision_no, next_sequence, feedback.clone());
                    next_sequence += 1;
                    if store.insert_if_absent(&revision)? {
                        plan.revised.push(revision.id);
                    }
                }
                _ => {}
            }
        }

        info!(
            phase = %phase.id,
            requeued = plan.requeued.len(),
            revised = plan.revised.len(),
            "planned retry round"
        );
        Ok(plan)
    }

    /// Settle items left `Dispatched` by a process that went away mid-attempt.
    ///
    /// The attempt counted, so items with attempts left return to `Pending`
    /// and the rest are `Blocked`. Returns the recovered item ids.
    pub fn recover_interrupted(&self, store: &dyn RunStore) -> Result<Vec<String>, StoreError> {
        let mut recovered = Vec::new();
        for item in store.list_all()? {
            if item.status != WorkItemStatus::Dispatched {
                continue;
            }
            let next = if item.has_attempts_left() {
                WorkItemStatus::Pending
            } else {
                WorkItemStatus::Blocked
            };
            let error = ItemError::new(
                ItemErrorKind::Interrupted,
                "attempt interrupted before it reported back",
            );
            match store.compare_and_update(&item.id, WorkItemStatus::Dispatched, &mut |i| {
                i.status = next;
                i.last_error = Some(error.clone());
            }) {
                Ok(_) => {}
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
            store.append_attempt(
                &AttemptRecord::new(
                    &item.id,
                    &item.phase_id,
                    item.attempt_count,
                    AttemptOutcome::TransientError,
                    0,
                )
                .with_error(error.message),
            )?;
            warn!(item = %item.id, status = %next, "recovered interrupted attempt");
            recovered.push(item.id);
        }
        Ok(recovered)
    }
}

/// Ids of the phase's items still waiting on dispatch.
pub fn unsettled_items(store: &dyn RunStore, phase_id: &str) -> Result<Vec<String>, StoreError> {
    Ok(store
        .list_by_phase(phase_id, None)?
        .into_iter()
        .filter(|i| !i.status.is_settled())
        .map(|i| i.id)
        .collect())
}

fn revision_root(id: &str) -> &str {
    id.split("~r").next().unwrap_or(id)
}

/// One past the highest revision number already used for the item's root.
fn next_revision_no(items: &[WorkItem], item: &WorkItem) -> u32 {
    let root = revision_root(&item.id);
    items
        .iter()
        .filter_map(|i| i.id.strip_prefix(root)?.strip_prefix("~r")?.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1
}
