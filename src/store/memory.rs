//! In-memory run store backed by sharded maps.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{
    AttemptLog, CheckpointStore, DecisionStore, GateStore, RunStore, WorkItemStore, apply_cas,
    apply_checkpoint, sorted,
};
use crate::audit::AttemptRecord;
use crate::decision::DecisionRecord;
use crate::errors::StoreError;
use crate::gates::GateResult;
use crate::orchestrator::state::RunState;
use crate::phase::RunDefinition;
use crate::work_item::{WorkItem, WorkItemStatus};

pub struct MemoryStore {
    run_id: String,
    items: DashMap<String, WorkItem>,
    checkpoint: Mutex<Option<RunState>>,
    gates: DashMap<String, Vec<GateResult>>,
    decisions: Mutex<Vec<DecisionRecord>>,
    attempts: Mutex<Vec<AttemptRecord>>,
    definition: Mutex<Option<RunDefinition>>,
    abort: AtomicBool,
}

impl MemoryStore {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            items: DashMap::new(),
            checkpoint: Mutex::new(None),
            gates: DashMap::new(),
            decisions: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            definition: Mutex::new(None),
            abort: AtomicBool::new(false),
        }
    }
}

impl WorkItemStore for MemoryStore {
    fn put(&self, item: &WorkItem) -> Result<(), StoreError> {
        match self.items.entry(item.id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().status.is_immutable() {
                    return Err(StoreError::Immutable {
                        id: item.id.clone(),
                        status: slot.get().status,
                    });
                }
                slot.insert(item.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(item.clone());
            }
        }
        Ok(())
    }

    fn insert_if_absent(&self, item: &WorkItem) -> Result<bool, StoreError> {
        match self.items.entry(item.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(item.clone());
                Ok(true)
            }
        }
    }

    fn get(&self, id: &str) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.items.get(id).map(|i| i.clone()))
    }

    fn list_by_phase(
        &self,
        phase_id: &str,
        status: Option<WorkItemStatus>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let items = self
            .items
            .iter()
            .filter(|i| i.phase_id == phase_id && status.is_none_or(|s| i.status == s))
            .map(|i| i.clone())
            .collect();
        Ok(sorted(items))
    }

    fn list_all(&self) -> Result<Vec<WorkItem>, StoreError> {
        Ok(sorted(self.items.iter().map(|i| i.clone()).collect()))
    }

    fn compare_and_update(
        &self,
        id: &str,
        expected: WorkItemStatus,
        mutate: &mut dyn FnMut(&mut WorkItem),
    ) -> Result<WorkItem, StoreError> {
        // The shard write lock is held for the whole read-check-write.
        let mut entry = self.items.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "Work item",
            id: id.to_string(),
        })?;
        let next = apply_cas(&entry, expected, mutate)?;
        debug!(item = id, from = %entry.status, to = %next.status, "work item updated");
        *entry = next.clone();
        Ok(next)
    }
}

impl CheckpointStore for MemoryStore {
    fn load_checkpoint(&self) -> Result<Option<RunState>, StoreError> {
        let guard = self.checkpoint.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.clone())
    }

    fn save_checkpoint(&self, state: &RunState, expected_seq: u64) -> Result<RunState, StoreError> {
        let mut guard = self.checkpoint.lock().map_err(|_| StoreError::LockPoisoned)?;
        let next = apply_checkpoint(guard.as_ref(), state, expected_seq)?;
        *guard = Some(next.clone());
        Ok(next)
    }
}

impl GateStore for MemoryStore {
    fn append_gate_result(&self, result: &GateResult) -> Result<(), StoreError> {
        self.gates
            .entry(result.phase_id.clone())
            .or_default()
            .push(result.clone());
        Ok(())
    }

    fn gate_history(&self, phase_id: &str) -> Result<Vec<GateResult>, StoreError> {
        Ok(self
            .gates
            .get(phase_id)
            .map(|h| h.clone())
            .unwrap_or_default())
    }
}

impl DecisionStore for MemoryStore {
    fn put_decision(&self, decision: &DecisionRecord) -> Result<(), StoreError> {
        let mut guard = self.decisions.lock().map_err(|_| StoreError::LockPoisoned)?;
        match guard.iter_mut().find(|d| d.id == decision.id) {
            Some(existing) => *existing = decision.clone(),
            None => guard.push(decision.clone()),
        }
        Ok(())
    }

    fn get_decision(&self, id: &str) -> Result<Option<DecisionRecord>, StoreError> {
        let guard = self.decisions.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.iter().find(|d| d.id == id).cloned())
    }

    fn list_decisions(&self) -> Result<Vec<DecisionRecord>, StoreError> {
        let guard = self.decisions.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.clone())
    }
}

impl AttemptLog for MemoryStore {
    fn append_attempt(&self, record: &AttemptRecord) -> Result<(), StoreError> {
        self.attempts
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .push(record.clone());
        Ok(())
    }

    fn attempts(&self) -> Result<Vec<AttemptRecord>, StoreError> {
        Ok(self
            .attempts
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .clone())
    }
}

impl RunStore for MemoryStore {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn save_definition(&self, definition: &RunDefinition) -> Result<(), StoreError> {
        *self.definition.lock().map_err(|_| StoreError::LockPoisoned)? = Some(definition.clone());
        Ok(())
    }

    fn load_definition(&self) -> Result<Option<RunDefinition>, StoreError> {
        Ok(self
            .definition
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .clone())
    }

    fn abort_requested(&self) -> Result<bool, StoreError> {
        Ok(self.abort.load(Ordering::SeqCst))
    }

    fn request_abort(&self) -> Result<(), StoreError> {
        self.abort.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use std::sync::Arc;

    #[test]
    fn test_list_is_ordered() {
        conformance::list_is_ordered(&MemoryStore::new("r1"));
    }

    #[test]
    fn test_cas_conflict() {
        conformance::cas_conflict(&MemoryStore::new("r1"));
    }

    #[test]
    fn test_succeeded_is_immutable() {
        conformance::succeeded_is_immutable(&MemoryStore::new("r1"));
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        conformance::insert_if_absent_keeps_existing(&MemoryStore::new("r1"));
    }

    #[test]
    fn test_attempt_budget_enforced() {
        conformance::attempt_budget_enforced(&MemoryStore::new("r1"));
    }

    #[test]
    fn test_checkpoint_cas() {
        conformance::checkpoint_cas(&MemoryStore::new("r1"));
    }

    #[test]
    fn test_gate_history_appends() {
        conformance::gate_history_appends(&MemoryStore::new("r1"));
    }

    #[test]
    fn test_decisions_and_attempts() {
        conformance::decisions_and_attempts(&MemoryStore::new("r1"));
    }

    #[test]
    fn test_concurrent_cas_has_one_winner() {
        let store = Arc::new(MemoryStore::new("r1"));
        store.put(&conformance::item("a", "p1", 0, 0)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .update_status("a", WorkItemStatus::Pending, WorkItemStatus::Dispatched)
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
