//! Rollback controller: phase-scoped compensation actions.
//!
//! Compensations are registered while a phase dispatches and are run in
//! reverse registration order when the phase blocks. Rollback of one phase
//! never touches compensations registered by another phase.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::errors::EngineError;

/// An undo action. Runs at most once.
pub type UndoFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Wrap an async undo closure as an `UndoFn`.
pub fn compensation<F, Fut>(undo: F) -> UndoFn
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || undo().boxed())
}

struct Compensation {
    label: String,
    undo: UndoFn,
}

#[derive(Default)]
pub struct RollbackController {
    compensations: Mutex<HashMap<String, Vec<Compensation>>>,
}

impl RollbackController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry stays consistent across a panicking holder: every
    /// mutation is a single push or remove.
    fn registry(&self) -> MutexGuard<'_, HashMap<String, Vec<Compensation>>> {
        self.compensations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_compensation(&self, phase_id: &str, label: &str, undo: UndoFn) {
        self.registry()
            .entry(phase_id.to_string())
            .or_default()
            .push(Compensation {
                label: label.to_string(),
                undo,
            });
    }

    /// Labels of the compensations waiting for `phase_id`, in registration order.
    pub fn pending(&self, phase_id: &str) -> Vec<String> {
        self.registry()
            .get(phase_id)
            .map(|list| list.iter().map(|c| c.label.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop a phase's compensations once its effects are accepted.
    pub fn discard(&self, phase_id: &str) {
        self.registry().remove(phase_id);
    }

    /// Run the phase's compensations newest first.
    ///
    /// Stops at the first failure. Compensations not yet run stay registered
    /// so an operator-driven retry can run them later. Returns how many ran.
    pub async fn rollback(&self, phase_id: &str) -> Result<usize, EngineError> {
        let mut list = self.registry().remove(phase_id).unwrap_or_default();

        let mut ran = 0;
        while let Some(comp) = list.pop() {
            info!(phase = phase_id, label = %comp.label, "running compensation");
            if let Err(e) = (comp.undo)().await {
                warn!(phase = phase_id, label = %comp.label, error = %e, "compensation failed");
                if !list.is_empty() {
                    let mut map = self.registry();
                    let entry = map.entry(phase_id.to_string()).or_default();
                    // Keep anything registered while we were running after the leftovers.
                    let newer = std::mem::take(entry);
                    entry.extend(list);
                    entry.extend(newer);
                }
                return Err(EngineError::RollbackFailure {
                    phase_id: phase_id.to_string(),
                    label: comp.label,
                    message: format!("{:#}", e),
                });
            }
            ran += 1;
        }
        Ok(ran)
    }
}
