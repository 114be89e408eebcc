//! Durable run state.
//!
//! A run store is scoped to a single run and holds its work items,
//! checkpoint, gate history, decisions, attempt log and definition
//! snapshot. Two backends share the same compare-and-swap rules:
//! - `MemoryStore` for tests and embedding
//! - `FileStore` for the CLI, one JSON file per record under the state directory

mod file;
mod memory;

pub use file::{FileStore, RunSummary};
pub use memory::MemoryStore;

use chrono::Utc;

use crate::audit::AttemptRecord;
use crate::decision::DecisionRecord;
use crate::errors::StoreError;
use crate::gates::GateResult;
use crate::orchestrator::state::{RunState, RunStatus};
use crate::phase::RunDefinition;
use crate::work_item::{WorkItem, WorkItemStatus, sort_by_dispatch_order};

pub trait WorkItemStore: Send + Sync {
    /// Create or replace an item. Immutable items cannot be replaced.
    fn put(&self, item: &WorkItem) -> Result<(), StoreError>;

    /// Create an item unless one with the same id exists. Returns whether it was inserted.
    fn insert_if_absent(&self, item: &WorkItem) -> Result<bool, StoreError>;

    fn get(&self, id: &str) -> Result<Option<WorkItem>, StoreError>;

    /// Items of a phase in dispatch order, optionally filtered by status.
    fn list_by_phase(
        &self,
        phase_id: &str,
        status: Option<WorkItemStatus>,
    ) -> Result<Vec<WorkItem>, StoreError>;

    fn list_all(&self) -> Result<Vec<WorkItem>, StoreError>;

    /// Compare-and-swap: apply `mutate` only if the item is still in `expected`.
    fn compare_and_update(
        &self,
        id: &str,
        expected: WorkItemStatus,
        mutate: &mut dyn FnMut(&mut WorkItem),
    ) -> Result<WorkItem, StoreError>;

    fn update_status(
        &self,
        id: &str,
        from: WorkItemStatus,
        to: WorkItemStatus,
    ) -> Result<WorkItem, StoreError> {
        self.compare_and_update(id, from, &mut |item| item.status = to)
    }
}

pub trait CheckpointStore: Send + Sync {
    fn load_checkpoint(&self) -> Result<Option<RunState>, StoreError>;

    /// Write `state` if the stored checkpoint is still at `expected_seq`
    /// (0 when none exists). Returns the stored state with its new `seq`.
    fn save_checkpoint(&self, state: &RunState, expected_seq: u64) -> Result<RunState, StoreError>;
}

pub trait GateStore: Send + Sync {
    fn append_gate_result(&self, result: &GateResult) -> Result<(), StoreError>;

    /// Every evaluation of the phase's gate, oldest first.
    fn gate_history(&self, phase_id: &str) -> Result<Vec<GateResult>, StoreError>;
}

pub trait DecisionStore: Send + Sync {
    fn put_decision(&self, decision: &DecisionRecord) -> Result<(), StoreError>;

    fn get_decision(&self, id: &str) -> Result<Option<DecisionRecord>, StoreError>;

    /// Oldest first.
    fn list_decisions(&self) -> Result<Vec<DecisionRecord>, StoreError>;
}

pub trait AttemptLog: Send + Sync {
    fn append_attempt(&self, record: &AttemptRecord) -> Result<(), StoreError>;

    fn attempts(&self) -> Result<Vec<AttemptRecord>, StoreError>;
}

/// Everything the run controller persists for one run.
pub trait RunStore: WorkItemStore + CheckpointStore + GateStore + DecisionStore + AttemptLog {
    fn run_id(&self) -> &str;

    fn save_definition(&self, definition: &RunDefinition) -> Result<(), StoreError>;

    fn load_definition(&self) -> Result<Option<RunDefinition>, StoreError>;

    /// Whether an out-of-process abort was requested.
    fn abort_requested(&self) -> Result<bool, StoreError>;

    fn request_abort(&self) -> Result<(), StoreError>;
}

/// Shared compare-and-swap rule for work items.
pub(crate) fn apply_cas(
    current: &WorkItem,
    expected: WorkItemStatus,
    mutate: &mut dyn FnMut(&mut WorkItem),
) -> Result<WorkItem, StoreError> {
    if current.status != expected {
        return Err(StoreError::Conflict {
            id: current.id.clone(),
            expected,
            actual: current.status,
        });
    }
    if current.status.is_immutable() {
        return Err(StoreError::Immutable {
            id: current.id.clone(),
            status: current.status,
        });
    }

    let mut next = current.clone();
    mutate(&mut next);
    next.id = current.id.clone();

    if next.status != current.status && !current.status.can_transition_to(next.status) {
        return Err(StoreError::InvalidTransition {
            id: current.id.clone(),
            from: current.status,
            to: next.status,
        });
    }
    if next.attempt_count > next.max_attempts {
        return Err(StoreError::AttemptsExceeded {
            id: current.id.clone(),
            attempts: next.attempt_count,
            max_attempts: next.max_attempts,
        });
    }
    next.updated_at = Utc::now();
    Ok(next)
}

/// Shared checkpoint rule: sequence CAS, sealed once complete.
pub(crate) fn apply_checkpoint(
    current: Option<&RunState>,
    state: &RunState,
    expected_seq: u64,
) -> Result<RunState, StoreError> {
    let actual = current.map_or(0, |c| c.seq);
    if let Some(existing) = current
        && existing.status == RunStatus::Complete
    {
        return Err(StoreError::RunSealed {
            run_id: existing.run_id.clone(),
        });
    }
    if actual != expected_seq {
        return Err(StoreError::StaleCheckpoint {
            run_id: state.run_id.clone(),
            expected: expected_seq,
            actual,
        });
    }
    let mut next = state.clone();
    next.seq = expected_seq + 1;
    next.last_checkpoint_at = Utc::now().max(next.started_at);
    Ok(next)
}

pub(crate) fn sorted(mut items: Vec<WorkItem>) -> Vec<WorkItem> {
    sort_by_dispatch_order(&mut items);
    items
}

/// Backend-independent checks run against both store implementations.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use serde_json::json;

    pub fn item(id: &str, phase: &str, priority: u32, sequence: u64) -> WorkItem {
        WorkItem::new(id, phase, "task", json!({}), priority, sequence, 2)
    }

    pub fn list_is_ordered(store: &dyn RunStore) {
        store.put(&item("c", "p1", 1, 2)).unwrap();
        store.put(&item("a", "p1", 0, 9)).unwrap();
        store.put(&item("b", "p1", 1, 1)).unwrap();
        store.put(&item("other", "p2", 0, 0)).unwrap();
        let ids: Vec<String> = store
            .list_by_phase("p1", None)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(
            store
                .list_by_phase("p1", Some(WorkItemStatus::Pending))
                .unwrap()
                .len(),
            3
        );
        assert_eq!(store.list_all().unwrap().len(), 4);
    }

    pub fn cas_conflict(store: &dyn RunStore) {
        store.put(&item("a", "p1", 0, 0)).unwrap();
        store
            .update_status("a", WorkItemStatus::Pending, WorkItemStatus::Dispatched)
            .unwrap();
        let err = store
            .update_status("a", WorkItemStatus::Pending, WorkItemStatus::Dispatched)
            .unwrap_err();
        assert!(err.is_conflict());
    }

    pub fn succeeded_is_immutable(store: &dyn RunStore) {
        store.put(&item("a", "p1", 0, 0)).unwrap();
        store
            .update_status("a", WorkItemStatus::Pending, WorkItemStatus::Dispatched)
            .unwrap();
        store
            .update_status("a", WorkItemStatus::Dispatched, WorkItemStatus::Succeeded)
            .unwrap();
        let err = store
            .update_status("a", WorkItemStatus::Succeeded, WorkItemStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, StoreError::Immutable { .. }));
        assert!(matches!(
            store.put(&item("a", "p1", 0, 0)).unwrap_err(),
            StoreError::Immutable { .. }
        ));
    }

    pub fn insert_if_absent_keeps_existing(store: &dyn RunStore) {
        assert!(store.insert_if_absent(&item("a", "p1", 0, 0)).unwrap());
        store
            .update_status("a", WorkItemStatus::Pending, WorkItemStatus::Dispatched)
            .unwrap();
        assert!(!store.insert_if_absent(&item("a", "p1", 0, 0)).unwrap());
        assert_eq!(
            store.get("a").unwrap().unwrap().status,
            WorkItemStatus::Dispatched
        );
    }

    pub fn attempt_budget_enforced(store: &dyn RunStore) {
        store.put(&item("a", "p1", 0, 0)).unwrap();
        let err = store
            .compare_and_update("a", WorkItemStatus::Pending, &mut |i| i.attempt_count = 3)
            .unwrap_err();
        assert!(matches!(err, StoreError::AttemptsExceeded { .. }));
    }

    pub fn checkpoint_cas(store: &dyn RunStore) {
        let state = RunState::new(store.run_id(), "demo");
        let saved = store.save_checkpoint(&state, 0).unwrap();
        assert_eq!(saved.seq, 1);
        assert!(saved.last_checkpoint_at >= saved.started_at);

        let stale = store.save_checkpoint(&state, 0).unwrap_err();
        assert!(matches!(stale, StoreError::StaleCheckpoint { .. }));

        let mut done = saved.clone();
        done.status = RunStatus::Complete;
        let sealed = store.save_checkpoint(&done, 1).unwrap();
        let err = store.save_checkpoint(&sealed, 2).unwrap_err();
        assert!(matches!(err, StoreError::RunSealed { .. }));
        assert_eq!(
            store.load_checkpoint().unwrap().unwrap().status,
            RunStatus::Complete
        );
    }

    pub fn gate_history_appends(store: &dyn RunStore) {
        for attempt in 0..2 {
            let result = GateResult::deterministic(
                "ci",
                "p1",
                attempt,
                vec![("ok".into(), attempt == 1)],
                String::new(),
                vec![],
            );
            store.append_gate_result(&result).unwrap();
        }
        let history = store.gate_history("p1").unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].passed);
        assert!(history[1].passed);
        assert!(store.gate_history("p2").unwrap().is_empty());
    }

    pub fn decisions_and_attempts(store: &dyn RunStore) {
        use crate::audit::AttemptOutcome;
        let mut decision = DecisionRecord::new(store.run_id(), "p1", 1, "blocked");
        store.put_decision(&decision).unwrap();
        decision.resolve(crate::decision::DecisionChoice::Retry);
        store.put_decision(&decision).unwrap();
        let listed = store.list_decisions().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_resolved());

        store
            .append_attempt(&AttemptRecord::new("a", "p1", 1, AttemptOutcome::Timeout, 5))
            .unwrap();
        store
            .append_attempt(&AttemptRecord::new("a", "p1", 2, AttemptOutcome::Ok, 5))
            .unwrap();
        let attempts = store.attempts().unwrap();
        assert_eq!(crate::audit::summarize(&attempts), vec!["a:timeout", "a:ok"]);

        assert!(!store.abort_requested().unwrap());
        store.request_abort().unwrap();
        assert!(store.abort_requested().unwrap());
    }
}
